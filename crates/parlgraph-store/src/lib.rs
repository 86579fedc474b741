pub mod embedding;
pub mod ids;
pub mod migrations;
pub mod models;
pub mod store;

pub use embedding::{
    EmbeddingProvider, EmbeddingResult, EmbeddingTask, GeminiEmbeddingProvider,
    OpenAiEmbeddingProvider, StubEmbeddingProvider,
};
pub use ids::{edge_id, node_id, normalize_label, speaker_node_id, utterance_id};
pub use models::*;
pub use store::{cosine_similarity, edge_rank_score, GraphStore};
