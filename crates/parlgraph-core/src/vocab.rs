//! Closed vocabularies for graph predicates and node types.

pub const PREDICATES: &[&str] = &[
    "AMENDS",
    "GOVERNS",
    "MODERNIZES",
    "AIMS_TO_REDUCE",
    "REQUIRES_APPROVAL",
    "IMPLEMENTED_BY",
    "RESPONSIBLE_FOR",
    "ASSOCIATED_WITH",
    "CAUSES",
    "ADDRESSES",
    "PROPOSES",
    "RESPONDS_TO",
    "AGREES_WITH",
    "DISAGREES_WITH",
    "QUESTIONS",
];

pub const NODE_TYPES: &[&str] = &[
    "foaf:Person",
    "schema:Legislation",
    "schema:Organization",
    "schema:Place",
    "skos:Concept",
];

pub const PERSON_TYPE: &str = "foaf:Person";

pub fn is_predicate(value: &str) -> bool {
    PREDICATES.contains(&value)
}

pub fn is_node_type(value: &str) -> bool {
    NODE_TYPES.contains(&value)
}

/// Python-style list rendering used in prompts and validation messages.
pub fn render_list(values: &[&str]) -> String {
    let quoted: Vec<String> = values.iter().map(|v| format!("'{v}'")).collect();
    format!("[{}]", quoted.join(", "))
}
