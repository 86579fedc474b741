use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::task;

use crate::migrations::run_migrations;
use crate::models::{
    AliasRecord, CitationRow, EdgeRecord, GraphCounts, ImportBundle, ImportStats, MatchReason,
    NodeRecord, NodeSummary, RosterEntry, SeedHit, Speaker, Utterance, Video,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed knowledge graph plus the transcript records it cites.
#[derive(Clone)]
pub struct GraphStore {
    db: Arc<Mutex<Connection>>,
}

/// Initialize sqlite-vec extension. Must be called before Connection::open().
fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

pub fn embedding_to_json(embedding: &[f32]) -> Result<String> {
    Ok(serde_json::to_string(embedding)?)
}

pub fn json_to_embedding(json: &str) -> Result<Vec<f32>> {
    Ok(serde_json::from_str(json)?)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Turns free text into an FTS5 query of quoted OR-ed terms, so user input
/// never reaches the FTS query grammar.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn date_to_sql(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format(DATE_FORMAT).to_string())
}

fn date_from_sql(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|v| NaiveDate::parse_from_str(&v, DATE_FORMAT).ok())
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn has_table(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE name = ?1",
        params![name],
        |r| r.get(0),
    )?)
}

fn row_to_edge(row: &Row<'_>) -> rusqlite::Result<EdgeRecord> {
    let utterance_ids: String = row.get(9)?;
    let speaker_ids: String = row.get(11)?;
    Ok(EdgeRecord {
        id: row.get(0)?,
        source_id: row.get(1)?,
        predicate: row.get(2)?,
        predicate_raw: row.get(3)?,
        target_id: row.get(4)?,
        youtube_video_id: row.get(5)?,
        earliest_timestamp: row.get(6)?,
        earliest_seconds: row.get(7)?,
        evidence: row.get(8)?,
        utterance_ids: parse_string_list(&utterance_ids),
        speaker_ids: parse_string_list(&speaker_ids),
        confidence: row.get(10)?,
        edge_rank_score: row.get(12)?,
        extractor_model: row.get(13)?,
        run_id: row.get(14)?,
    })
}

const EDGE_COLUMNS: &str = "e.id, e.source_id, e.predicate, e.predicate_raw, e.target_id, \
     e.youtube_video_id, e.earliest_timestamp_str, e.earliest_seconds, e.evidence, \
     e.utterance_ids, e.confidence, e.speaker_ids, e.edge_rank_score, e.extractor_model, e.kg_run_id";

impl GraphStore {
    pub fn open(path: &str) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            f(&mut conn)
        })
        .await?
    }

    /// Create (or recreate on a dimension change) the node vector table.
    /// Recreating clears stored embeddings so nodes are embedded again.
    pub fn ensure_vec_table(&self, dimensions: usize) -> Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

        let current_dims: Option<String> = db
            .query_row(
                "SELECT value FROM meta WHERE key = 'vec_dimensions'",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let needs_recreate = match current_dims {
            Some(d) => d.parse::<usize>().unwrap_or(0) != dimensions,
            None => true,
        };

        if needs_recreate {
            db.execute_batch("DROP TABLE IF EXISTS kg_nodes_vec;")?;
            db.execute_batch(&format!(
                "CREATE VIRTUAL TABLE kg_nodes_vec USING vec0(node_id TEXT PRIMARY KEY, embedding float[{dimensions}] distance_metric=cosine);"
            ))?;
            db.execute("UPDATE kg_nodes SET embedding = NULL", [])?;
            db.execute(
                "INSERT INTO meta(key, value) VALUES('vec_dimensions', ?1) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![dimensions.to_string()],
            )?;
            tracing::info!("created kg_nodes_vec virtual table with {dimensions} dimensions");
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Transcript records
    // ------------------------------------------------------------------

    pub async fn import(&self, bundle: ImportBundle) -> Result<ImportStats> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for video in &bundle.videos {
                tx.execute(
                    r#"
                    INSERT INTO videos(youtube_video_id, title, video_date)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(youtube_video_id) DO UPDATE SET
                        title = COALESCE(excluded.title, videos.title),
                        video_date = COALESCE(excluded.video_date, videos.video_date)
                    "#,
                    params![video.youtube_video_id, video.title, date_to_sql(video.video_date)],
                )?;
            }
            for speaker in &bundle.speakers {
                tx.execute(
                    r#"
                    INSERT INTO speakers(id, full_name, normalized_name, title, position)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        full_name = COALESCE(excluded.full_name, speakers.full_name),
                        normalized_name = COALESCE(excluded.normalized_name, speakers.normalized_name),
                        title = COALESCE(excluded.title, speakers.title),
                        position = COALESCE(excluded.position, speakers.position)
                    "#,
                    params![
                        speaker.id,
                        speaker.full_name,
                        speaker.normalized_name,
                        speaker.title,
                        speaker.position
                    ],
                )?;
            }
            for utt in &bundle.utterances {
                tx.execute(
                    r#"
                    INSERT INTO utterances(id, youtube_video_id, seconds_since_start, timestamp_str, speaker_id, text)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(id) DO UPDATE SET
                        timestamp_str = excluded.timestamp_str,
                        speaker_id = excluded.speaker_id,
                        text = excluded.text
                    "#,
                    params![
                        utt.id,
                        utt.youtube_video_id,
                        utt.seconds_since_start,
                        utt.timestamp,
                        utt.speaker_id,
                        utt.text
                    ],
                )?;
            }
            for entry in &bundle.roster {
                tx.execute(
                    r#"
                    INSERT INTO session_roster(session_date, name, title, role)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(session_date, name) DO UPDATE SET
                        title = excluded.title,
                        role = excluded.role
                    "#,
                    params![
                        entry.session_date.format(DATE_FORMAT).to_string(),
                        entry.name,
                        entry.title,
                        entry.role
                    ],
                )?;
            }
            tx.commit()?;
            Ok(ImportStats {
                videos: bundle.videos.len(),
                speakers: bundle.speakers.len(),
                utterances: bundle.utterances.len(),
                roster: bundle.roster.len(),
            })
        })
        .await
    }

    pub async fn fetch_utterances(&self, video_id: &str) -> Result<Vec<Utterance>> {
        let video_id = video_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, youtube_video_id, seconds_since_start, timestamp_str, speaker_id, text
                FROM utterances
                WHERE youtube_video_id = ?1
                ORDER BY seconds_since_start ASC, id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![video_id], |r| {
                Ok(Utterance {
                    id: r.get(0)?,
                    youtube_video_id: r.get(1)?,
                    seconds_since_start: r.get(2)?,
                    timestamp: r.get(3)?,
                    speaker_id: r.get(4)?,
                    text: r.get(5)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn speakers_by_ids(&self, ids: Vec<String>) -> Result<HashMap<String, Speaker>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT id, full_name, normalized_name, title, position FROM speakers WHERE id IN ({})",
                placeholders(1, ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |r| {
                Ok(Speaker {
                    id: r.get(0)?,
                    full_name: r.get(1)?,
                    normalized_name: r.get(2)?,
                    title: r.get(3)?,
                    position: r.get(4)?,
                })
            })?;
            let mut out = HashMap::new();
            for row in rows {
                let speaker = row?;
                out.insert(speaker.id.clone(), speaker);
            }
            Ok(out)
        })
        .await
    }

    /// Roster entries from the `max_sessions` most recent sittings, newest first.
    pub async fn recent_roster(&self, max_sessions: usize) -> Result<Vec<RosterEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT session_date, name, title, role
                FROM session_roster
                WHERE session_date IN (
                    SELECT DISTINCT session_date FROM session_roster
                    ORDER BY session_date DESC
                    LIMIT ?1
                )
                ORDER BY session_date DESC, name ASC
                "#,
            )?;
            let rows = stmt.query_map(params![max_sessions as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (date, name, title, role) = row?;
                let Some(session_date) = date_from_sql(Some(date)) else {
                    continue;
                };
                out.push(RosterEntry {
                    session_date,
                    name,
                    title,
                    role,
                });
            }
            Ok(out)
        })
        .await
    }

    pub async fn video(&self, video_id: &str) -> Result<Option<Video>> {
        let video_id = video_id.to_owned();
        self.with_conn(move |conn| {
            let video = conn
                .query_row(
                    "SELECT youtube_video_id, title, video_date FROM videos WHERE youtube_video_id = ?1",
                    params![video_id],
                    |r| {
                        Ok(Video {
                            youtube_video_id: r.get(0)?,
                            title: r.get(1)?,
                            video_date: date_from_sql(r.get(2)?),
                        })
                    },
                )
                .optional()?;
            Ok(video)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Graph writes
    // ------------------------------------------------------------------

    /// Upsert nodes, refreshing label and aliases on conflict. Returns how
    /// many ids were not present before.
    pub async fn upsert_nodes(&self, nodes: Vec<NodeRecord>) -> Result<usize> {
        if nodes.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            let mut created = 0;
            for node in &nodes {
                let exists: bool = tx.query_row(
                    "SELECT COUNT(*) > 0 FROM kg_nodes WHERE id = ?1",
                    params![node.id],
                    |r| r.get(0),
                )?;
                if !exists {
                    created += 1;
                }
                let aliases = serde_json::to_string(&node.aliases)?;
                tx.execute(
                    r#"
                    INSERT INTO kg_nodes(id, label, type, aliases, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                    ON CONFLICT(id) DO UPDATE SET
                        label = excluded.label,
                        aliases = excluded.aliases,
                        updated_at = excluded.updated_at
                    "#,
                    params![node.id, node.label, node.node_type, aliases, now],
                )?;
                tx.execute("DELETE FROM kg_nodes_fts WHERE id = ?1", params![node.id])?;
                tx.execute(
                    "INSERT INTO kg_nodes_fts(label, aliases, id) VALUES (?1, ?2, ?3)",
                    params![node.label, node.aliases.join(" "), node.id],
                )?;
            }
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    /// Insert aliases; an existing `alias_norm` keeps its first owner.
    pub async fn insert_aliases(&self, aliases: Vec<AliasRecord>) -> Result<usize> {
        if aliases.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            for alias in &aliases {
                inserted += tx.execute(
                    r#"
                    INSERT INTO kg_aliases(alias_norm, alias_raw, node_id, type, source, confidence)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(alias_norm) DO NOTHING
                    "#,
                    params![
                        alias.alias_norm,
                        alias.alias_raw,
                        alias.node_id,
                        alias.node_type,
                        alias.source,
                        alias.confidence
                    ],
                )?;
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    pub async fn existing_node_ids(&self, ids: Vec<String>) -> Result<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT id FROM kg_nodes WHERE id IN ({})",
                placeholders(1, ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |r| r.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
        })
        .await
    }

    /// Insert-or-ignore on the content-addressed edge id. Returns the number
    /// of rows actually written.
    pub async fn insert_edges(&self, edges: Vec<EdgeRecord>) -> Result<usize> {
        if edges.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            let mut inserted = 0;
            for edge in &edges {
                inserted += tx.execute(
                    r#"
                    INSERT INTO kg_edges(
                        id, source_id, predicate, predicate_raw, target_id, youtube_video_id,
                        earliest_timestamp_str, earliest_seconds, utterance_ids, evidence,
                        speaker_ids, confidence, edge_rank_score, extractor_model, kg_run_id, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                    ON CONFLICT(id) DO NOTHING
                    "#,
                    params![
                        edge.id,
                        edge.source_id,
                        edge.predicate,
                        edge.predicate_raw,
                        edge.target_id,
                        edge.youtube_video_id,
                        edge.earliest_timestamp,
                        edge.earliest_seconds,
                        serde_json::to_string(&edge.utterance_ids)?,
                        edge.evidence,
                        serde_json::to_string(&edge.speaker_ids)?,
                        edge.confidence,
                        edge.edge_rank_score,
                        edge.extractor_model,
                        edge.run_id,
                        now
                    ],
                )?;
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    /// `(id, label)` for the given nodes that have no embedding yet.
    pub async fn nodes_missing_embedding(&self, ids: Vec<String>) -> Result<Vec<(String, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT id, label FROM kg_nodes WHERE embedding IS NULL AND id IN ({}) ORDER BY id",
                placeholders(1, ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, label) = row?;
                if !label.trim().is_empty() {
                    out.push((id, label));
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn store_node_embeddings(&self, embeddings: Vec<(String, Vec<f32>)>) -> Result<usize> {
        if embeddings.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let has_vec = has_table(conn, "kg_nodes_vec")?;
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            for (id, embedding) in &embeddings {
                let json = embedding_to_json(embedding)?;
                tx.execute(
                    "UPDATE kg_nodes SET embedding = ?1, updated_at = ?2 WHERE id = ?3",
                    params![json, now, id],
                )?;
                if has_vec {
                    tx.execute("DELETE FROM kg_nodes_vec WHERE node_id = ?1", params![id])?;
                    tx.execute(
                        "INSERT INTO kg_nodes_vec(node_id, embedding) VALUES (?1, ?2)",
                        params![id, json],
                    )?;
                }
            }
            tx.commit()?;
            Ok(embeddings.len())
        })
        .await
    }

    /// Recompute `edge_rank_score = confidence * (1 + ln(corroboration))`,
    /// where corroboration counts stored edges sharing the same triple.
    pub async fn refresh_edge_ranks(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let mut support: HashMap<(String, String, String), i64> = HashMap::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT source_id, predicate, target_id, COUNT(*) FROM kg_edges GROUP BY source_id, predicate, target_id",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok((
                        (r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?),
                        r.get::<_, i64>(3)?,
                    ))
                })?;
                for row in rows {
                    let (key, count) = row?;
                    support.insert(key, count);
                }
            }

            let edges: Vec<(String, (String, String, String), f64)> = {
                let mut stmt = conn
                    .prepare("SELECT id, source_id, predicate, target_id, confidence FROM kg_edges")?;
                let rows = stmt.query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        (r.get::<_, String>(1)?, r.get::<_, String>(2)?, r.get::<_, String>(3)?),
                        r.get::<_, f64>(4)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let tx = conn.transaction()?;
            for (id, key, confidence) in &edges {
                let count = support.get(key).copied().unwrap_or(1).max(1);
                let score = edge_rank_score(*confidence, count);
                tx.execute(
                    "UPDATE kg_edges SET edge_rank_score = ?1 WHERE id = ?2",
                    params![score, id],
                )?;
            }
            tx.commit()?;
            Ok(edges.len())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Graph reads
    // ------------------------------------------------------------------

    pub async fn vector_seeds(&self, query_embedding: Vec<f32>, k: usize) -> Result<Vec<SeedHit>> {
        if k == 0 || query_embedding.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            if has_table(conn, "kg_nodes_vec")? {
                let query_json = embedding_to_json(&query_embedding)?;
                let mut stmt = conn.prepare(
                    r#"
                    SELECT n.id, n.type, n.label, n.aliases, v.distance
                    FROM kg_nodes_vec v
                    JOIN kg_nodes n ON n.id = v.node_id
                    WHERE v.embedding MATCH ?1 AND k = ?2
                    ORDER BY v.distance
                    "#,
                )?;
                let rows = stmt.query_map(params![query_json, k as i64], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, f64>(4)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, node_type, label, aliases, distance) = row?;
                    out.push(SeedHit {
                        id,
                        node_type,
                        label,
                        aliases: parse_string_list(&aliases),
                        score: 1.0 - distance,
                        match_reason: MatchReason::Vector,
                    });
                }
                return Ok(out);
            }

            let mut stmt = conn.prepare(
                "SELECT id, type, label, aliases, embedding FROM kg_nodes WHERE embedding IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, node_type, label, aliases, embedding_json) = row?;
                let embedding = json_to_embedding(&embedding_json)?;
                out.push(SeedHit {
                    id,
                    node_type,
                    label,
                    aliases: parse_string_list(&aliases),
                    score: cosine_similarity(&query_embedding, &embedding) as f64,
                    match_reason: MatchReason::Vector,
                });
            }
            out.sort_by(|a, b| b.score.total_cmp(&a.score));
            out.truncate(k);
            Ok(out)
        })
        .await
    }

    pub async fn fulltext_seeds(&self, query: &str, k: usize) -> Result<Vec<SeedHit>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        let result = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT n.id, n.type, n.label, n.aliases, bm25(kg_nodes_fts) AS rank
                    FROM kg_nodes_fts
                    JOIN kg_nodes n ON n.id = kg_nodes_fts.id
                    WHERE kg_nodes_fts MATCH ?1
                    ORDER BY rank
                    LIMIT ?2
                    "#,
                )?;
                let rows = stmt.query_map(params![match_expr, k as i64], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, f64>(4)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, node_type, label, aliases, rank) = row?;
                    let relevance = (-rank).max(0.0);
                    out.push(SeedHit {
                        id,
                        node_type,
                        label,
                        aliases: parse_string_list(&aliases),
                        score: relevance / (1.0 + relevance),
                        match_reason: MatchReason::Fulltext,
                    });
                }
                Ok(out)
            })
            .await;

        match result {
            Ok(hits) => Ok(hits),
            Err(e) => {
                tracing::debug!("full-text seed search failed (continuing without it): {e}");
                Ok(Vec::new())
            }
        }
    }

    pub async fn alias_seeds(&self, alias_norm: &str, limit: usize) -> Result<Vec<SeedHit>> {
        if alias_norm.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let alias_norm = alias_norm.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT n.id, n.type, n.label, n.aliases
                FROM kg_aliases a
                JOIN kg_nodes n ON n.id = a.node_id
                WHERE a.alias_norm = ?1
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![alias_norm, limit as i64], |r| {
                Ok(SeedHit {
                    id: r.get(0)?,
                    node_type: r.get(1)?,
                    label: r.get(2)?,
                    aliases: parse_string_list(&r.get::<_, String>(3)?),
                    score: 1.0,
                    match_reason: MatchReason::Alias,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Edges with an endpoint in `frontier`, skipping `exclude`, ordered by
    /// edge rank, then confidence, then recency.
    pub async fn edges_touching(
        &self,
        frontier: Vec<String>,
        exclude: Vec<String>,
        limit: usize,
    ) -> Result<Vec<EdgeRecord>> {
        if frontier.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let n = frontier.len();
            let frontier_list = placeholders(1, n);
            let frontier_list_2 = placeholders(n + 1, n);
            let exclude_clause = if exclude.is_empty() {
                String::new()
            } else {
                format!("AND e.id NOT IN ({})", placeholders(2 * n + 1, exclude.len()))
            };
            let limit_param = 2 * n + exclude.len() + 1;
            let sql = format!(
                r#"
                SELECT {EDGE_COLUMNS}
                FROM kg_edges e
                LEFT JOIN videos v ON v.youtube_video_id = e.youtube_video_id
                WHERE (e.source_id IN ({frontier_list}) OR e.target_id IN ({frontier_list_2}))
                {exclude_clause}
                ORDER BY COALESCE(e.edge_rank_score, 0) DESC,
                         e.confidence DESC,
                         COALESCE(v.video_date, '') DESC,
                         COALESCE(e.earliest_seconds, 0) DESC,
                         e.id ASC
                LIMIT ?{limit_param}
                "#
            );

            let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(limit_param);
            for id in frontier.iter().chain(frontier.iter()).chain(exclude.iter()) {
                values.push(rusqlite::types::Value::Text(id.clone()));
            }
            values.push(rusqlite::types::Value::Integer(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_edge)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn nodes_by_ids(&self, ids: Vec<String>) -> Result<Vec<NodeSummary>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT id, label, type FROM kg_nodes WHERE id IN ({})",
                placeholders(1, ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |r| {
                Ok(NodeSummary {
                    id: r.get(0)?,
                    label: r.get(1)?,
                    node_type: r.get(2)?,
                })
            })?;
            let mut by_id: HashMap<String, NodeSummary> = HashMap::new();
            for row in rows {
                let node = row?;
                by_id.insert(node.id.clone(), node);
            }
            Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
        })
        .await
    }

    pub async fn node_records(&self, ids: Vec<String>) -> Result<Vec<NodeRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT id, type, label, aliases FROM kg_nodes WHERE id IN ({})",
                placeholders(1, ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |r| {
                Ok(NodeRecord {
                    id: r.get(0)?,
                    node_type: r.get(1)?,
                    label: r.get(2)?,
                    aliases: parse_string_list(&r.get::<_, String>(3)?),
                })
            })?;
            let mut by_id: HashMap<String, NodeRecord> = HashMap::new();
            for row in rows {
                let node = row?;
                by_id.insert(node.id.clone(), node);
            }
            Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
        })
        .await
    }

    /// Utterances joined with speaker and video rows, in the order of `ids`.
    pub async fn citation_rows(&self, ids: Vec<String>) -> Result<Vec<CitationRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(move |conn| {
            let sql = format!(
                r#"
                SELECT u.id, u.text, u.seconds_since_start, u.timestamp_str, u.youtube_video_id,
                       v.title, v.video_date,
                       u.speaker_id, s.full_name, s.normalized_name, s.title, s.position
                FROM utterances u
                LEFT JOIN videos v ON v.youtube_video_id = u.youtube_video_id
                LEFT JOIN speakers s ON s.id = u.speaker_id
                WHERE u.id IN ({})
                "#,
                placeholders(1, ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), |r| {
                Ok(CitationRow {
                    utterance_id: r.get(0)?,
                    text: r.get(1)?,
                    seconds_since_start: r.get(2)?,
                    timestamp: r.get(3)?,
                    youtube_video_id: r.get(4)?,
                    video_title: r.get(5)?,
                    video_date: date_from_sql(r.get(6)?),
                    speaker: Speaker {
                        id: r.get(7)?,
                        full_name: r.get(8)?,
                        normalized_name: r.get(9)?,
                        title: r.get(10)?,
                        position: r.get(11)?,
                    },
                })
            })?;
            let mut by_id: HashMap<String, CitationRow> = HashMap::new();
            for row in rows {
                let citation = row?;
                by_id.insert(citation.utterance_id.clone(), citation);
            }
            Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
        })
        .await
    }

    pub async fn counts(&self) -> Result<GraphCounts> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
            Ok(GraphCounts {
                videos: count("SELECT COUNT(*) FROM videos")?,
                speakers: count("SELECT COUNT(*) FROM speakers")?,
                utterances: count("SELECT COUNT(*) FROM utterances")?,
                nodes: count("SELECT COUNT(*) FROM kg_nodes")?,
                embedded_nodes: count("SELECT COUNT(*) FROM kg_nodes WHERE embedding IS NOT NULL")?,
                aliases: count("SELECT COUNT(*) FROM kg_aliases")?,
                edges: count("SELECT COUNT(*) FROM kg_edges")?,
            })
        })
        .await
    }
}

pub fn edge_rank_score(confidence: f64, corroboration: i64) -> f64 {
    confidence * (1.0 + (corroboration.max(1) as f64).ln())
}
