use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

type Migration = (i64, &'static str);

fn migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS videos (
                youtube_video_id TEXT PRIMARY KEY,
                title TEXT,
                video_date TEXT
            );

            CREATE TABLE IF NOT EXISTS speakers (
                id TEXT PRIMARY KEY,
                full_name TEXT,
                normalized_name TEXT,
                title TEXT,
                position TEXT
            );

            CREATE TABLE IF NOT EXISTS utterances (
                id TEXT PRIMARY KEY,
                youtube_video_id TEXT NOT NULL,
                seconds_since_start INTEGER NOT NULL,
                timestamp_str TEXT NOT NULL,
                speaker_id TEXT NOT NULL,
                text TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_utterances_video_seconds
                ON utterances(youtube_video_id, seconds_since_start);
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS session_roster (
                session_date TEXT NOT NULL,
                name TEXT NOT NULL,
                title TEXT,
                role TEXT,
                PRIMARY KEY (session_date, name)
            );

            CREATE INDEX IF NOT EXISTS idx_session_roster_date ON session_roster(session_date DESC);
            "#,
        ),
        (
            3,
            r#"
            CREATE TABLE IF NOT EXISTS kg_nodes (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                type TEXT NOT NULL,
                aliases TEXT NOT NULL DEFAULT '[]',
                embedding TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_kg_nodes_type ON kg_nodes(type);

            CREATE TABLE IF NOT EXISTS kg_aliases (
                alias_norm TEXT PRIMARY KEY,
                alias_raw TEXT NOT NULL,
                node_id TEXT NOT NULL,
                type TEXT NOT NULL,
                source TEXT NOT NULL,
                confidence REAL
            );

            CREATE INDEX IF NOT EXISTS idx_kg_aliases_node ON kg_aliases(node_id);

            CREATE VIRTUAL TABLE IF NOT EXISTS kg_nodes_fts USING fts5(
                label,
                aliases,
                id UNINDEXED
            );
            "#,
        ),
        (
            4,
            r#"
            CREATE TABLE IF NOT EXISTS kg_edges (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                predicate TEXT NOT NULL,
                predicate_raw TEXT,
                target_id TEXT NOT NULL,
                youtube_video_id TEXT NOT NULL,
                earliest_timestamp_str TEXT,
                earliest_seconds INTEGER,
                utterance_ids TEXT NOT NULL,
                evidence TEXT NOT NULL,
                speaker_ids TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL,
                edge_rank_score REAL,
                extractor_model TEXT,
                kg_run_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_kg_edges_source ON kg_edges(source_id);
            CREATE INDEX IF NOT EXISTS idx_kg_edges_target ON kg_edges(target_id);
            CREATE INDEX IF NOT EXISTS idx_kg_edges_video ON kg_edges(youtube_video_id);
            CREATE INDEX IF NOT EXISTS idx_kg_edges_triple ON kg_edges(source_id, predicate, target_id);
            "#,
        ),
    ]
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut applied = HashSet::new();
    for row in rows {
        applied.insert(row?);
    }

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO __schema_version(version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
        tracing::debug!("applied schema migration {version}");
    }

    Ok(())
}
