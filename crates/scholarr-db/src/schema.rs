//! SQLite schema. Applied idempotently at startup by [`crate::Database::initialize`].

pub const TABLE_USERS: &str = "users";
pub const TABLE_SCHOLAR_PROFILES: &str = "scholar_profiles";
pub const TABLE_PUBLICATIONS: &str = "publications";
pub const TABLE_LINKS: &str = "scholar_publication_links";
pub const TABLE_RUNS: &str = "runs";
pub const TABLE_RUN_SCHOLAR_RESULTS: &str = "run_scholar_results";
pub const TABLE_CONTINUATION_QUEUE: &str = "continuation_queue";
pub const TABLE_PDF_QUEUE: &str = "pdf_queue";
pub const TABLE_SAFETY_STATE: &str = "safety_state";

/// Ordered DDL statements. Each is `IF NOT EXISTS` so re-running is safe.
pub const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        email       TEXT NOT NULL UNIQUE,
        is_admin    INTEGER NOT NULL DEFAULT 0,
        is_active   INTEGER NOT NULL DEFAULT 1,
        api_token   TEXT UNIQUE,
        settings    TEXT NOT NULL DEFAULT '{}',
        created_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS scholar_profiles (
        id                     INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id                INTEGER NOT NULL REFERENCES users(id),
        scholar_id             TEXT NOT NULL,
        display_name           TEXT NOT NULL DEFAULT '',
        affiliation            TEXT,
        profile_image_source   TEXT NOT NULL DEFAULT 'fallback',
        profile_image_url      TEXT,
        is_enabled             INTEGER NOT NULL DEFAULT 1,
        last_checked_at        TEXT,
        last_outcome           TEXT,
        last_fingerprint_head  TEXT,
        created_at             TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_scholar_profiles_user_scholar
        ON scholar_profiles(user_id, scholar_id)",
    "CREATE TABLE IF NOT EXISTS publications (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint        TEXT NOT NULL,
        canonical_title    TEXT NOT NULL,
        year               INTEGER,
        venue_text         TEXT,
        cluster_id         TEXT,
        doi                TEXT,
        arxiv_id           TEXT,
        pmid               TEXT,
        openalex_id        TEXT,
        pub_url            TEXT,
        pdf_url            TEXT,
        pdf_status         TEXT NOT NULL DEFAULT 'untracked',
        pdf_attempt_count  INTEGER NOT NULL DEFAULT 0,
        pdf_failure_reason TEXT,
        created_at         TEXT NOT NULL,
        updated_at         TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_fingerprint
        ON publications(fingerprint)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_cluster
        ON publications(cluster_id) WHERE cluster_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_doi
        ON publications(doi) WHERE doi IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_arxiv
        ON publications(arxiv_id) WHERE arxiv_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_pmid
        ON publications(pmid) WHERE pmid IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS scholar_publication_links (
        scholar_profile_id    INTEGER NOT NULL REFERENCES scholar_profiles(id),
        publication_id        INTEGER NOT NULL REFERENCES publications(id),
        first_seen_run_id     INTEGER NOT NULL,
        last_seen_run_id      INTEGER,
        is_read               INTEGER NOT NULL DEFAULT 0,
        is_favorite           INTEGER NOT NULL DEFAULT 0,
        is_new_in_latest_run  INTEGER NOT NULL DEFAULT 1,
        citation_count        INTEGER NOT NULL DEFAULT 0,
        link_scholar_pub_url  TEXT,
        created_at            TEXT NOT NULL,
        PRIMARY KEY (scholar_profile_id, publication_id)
    )",
    "CREATE TABLE IF NOT EXISTS runs (
        id                     INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id                INTEGER NOT NULL REFERENCES users(id),
        trigger_kind           TEXT NOT NULL,
        status                 TEXT NOT NULL DEFAULT 'pending',
        start_dt               TEXT NOT NULL,
        end_dt                 TEXT,
        scholar_count          INTEGER NOT NULL DEFAULT 0,
        new_publication_count  INTEGER NOT NULL DEFAULT 0,
        failed_count           INTEGER NOT NULL DEFAULT 0,
        partial_count          INTEGER NOT NULL DEFAULT 0,
        cancel_requested       INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_runs_user_status ON runs(user_id, status)",
    "CREATE TABLE IF NOT EXISTS run_scholar_results (
        run_id              INTEGER NOT NULL REFERENCES runs(id),
        scholar_profile_id  INTEGER NOT NULL REFERENCES scholar_profiles(id),
        outcome             TEXT NOT NULL,
        state               TEXT NOT NULL,
        state_reason        TEXT,
        publication_count   INTEGER NOT NULL DEFAULT 0,
        attempt_count       INTEGER NOT NULL DEFAULT 1,
        warnings            TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (run_id, scholar_profile_id)
    )",
    "CREATE TABLE IF NOT EXISTS continuation_queue (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id             INTEGER NOT NULL REFERENCES users(id),
        scholar_profile_id  INTEGER NOT NULL REFERENCES scholar_profiles(id),
        resume_cursor       INTEGER NOT NULL,
        attempt_count       INTEGER NOT NULL DEFAULT 1,
        status              TEXT NOT NULL DEFAULT 'queued',
        next_attempt_dt     TEXT NOT NULL,
        created_at          TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_continuation_active
        ON continuation_queue(user_id, scholar_profile_id)
        WHERE status IN ('queued', 'retrying')",
    "CREATE TABLE IF NOT EXISTS pdf_queue (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        publication_id   INTEGER NOT NULL REFERENCES publications(id),
        status           TEXT NOT NULL DEFAULT 'queued',
        attempt_count    INTEGER NOT NULL DEFAULT 0,
        next_attempt_dt  TEXT NOT NULL,
        last_error       TEXT,
        created_at       TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_pdf_queue_active
        ON pdf_queue(publication_id)
        WHERE status IN ('queued', 'running')",
    "CREATE TABLE IF NOT EXISTS safety_state (
        user_id                   INTEGER PRIMARY KEY REFERENCES users(id),
        cooldown_active           INTEGER NOT NULL DEFAULT 0,
        cooldown_reason           TEXT NOT NULL DEFAULT 'none',
        cooldown_until            TEXT,
        consecutive_blocked_runs  INTEGER NOT NULL DEFAULT 0,
        consecutive_network_runs  INTEGER NOT NULL DEFAULT 0,
        cooldown_entry_count      INTEGER NOT NULL DEFAULT 0,
        blocked_start_count       INTEGER NOT NULL DEFAULT 0,
        last_evaluated_run_id     INTEGER
    )",
];
