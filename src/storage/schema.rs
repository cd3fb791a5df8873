//! Database schema definition

/// SQL schema for the Critic cache
pub const SCHEMA: &str = r#"
-- Registered git repositories
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    path TEXT NOT NULL
);

-- Interned file paths
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE
);

-- Diff requests between two commits
CREATE TABLE IF NOT EXISTS changesets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository INTEGER NOT NULL,
    from_commit TEXT,
    to_commit TEXT NOT NULL,
    for_merge TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    complete INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (repository) REFERENCES repositories(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_changesets_commits
    ON changesets(repository, COALESCE(from_commit, ''), to_commit, COALESCE(for_merge, ''));
CREATE INDEX IF NOT EXISTS idx_changesets_for_merge ON changesets(for_merge);

-- Files altered by a changeset
CREATE TABLE IF NOT EXISTS changedfiles (
    changeset INTEGER NOT NULL,
    file INTEGER NOT NULL,
    old_sha1 TEXT,
    old_mode INTEGER,
    new_sha1 TEXT,
    new_mode INTEGER,
    PRIMARY KEY (changeset, file),
    FOREIGN KEY (changeset) REFERENCES changesets(id) ON DELETE CASCADE,
    FOREIGN KEY (file) REFERENCES files(id)
);

-- Content difference requests
CREATE TABLE IF NOT EXISTS changesetcontentdifferences (
    changeset INTEGER PRIMARY KEY,
    complete INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (changeset) REFERENCES changesets(id) ON DELETE CASCADE
);

-- Per-file examination results
CREATE TABLE IF NOT EXISTS changesetfiledifferences (
    changeset INTEGER NOT NULL,
    file INTEGER NOT NULL,
    comparison_pending INTEGER NOT NULL,
    old_is_binary INTEGER NOT NULL DEFAULT 0,
    new_is_binary INTEGER NOT NULL DEFAULT 0,
    old_length INTEGER,
    new_length INTEGER,
    old_linebreak INTEGER NOT NULL DEFAULT 0,
    new_linebreak INTEGER NOT NULL DEFAULT 0,
    old_highlightfile INTEGER,
    new_highlightfile INTEGER,
    PRIMARY KEY (changeset, file),
    FOREIGN KEY (changeset) REFERENCES changesets(id) ON DELETE CASCADE,
    FOREIGN KEY (old_highlightfile) REFERENCES highlightfiles(id),
    FOREIGN KEY (new_highlightfile) REFERENCES highlightfiles(id)
);

-- Modified line blocks
CREATE TABLE IF NOT EXISTS changesetchangedlines (
    changeset INTEGER NOT NULL,
    file INTEGER NOT NULL,
    block_index INTEGER NOT NULL,
    line_offset INTEGER NOT NULL,
    delete_count INTEGER NOT NULL,
    delete_length INTEGER NOT NULL,
    insert_count INTEGER NOT NULL,
    insert_length INTEGER NOT NULL,
    analysis TEXT,
    PRIMARY KEY (changeset, file, block_index),
    FOREIGN KEY (changeset) REFERENCES changesets(id) ON DELETE CASCADE
);

-- Highlighting requests per changeset
CREATE TABLE IF NOT EXISTS changesethighlightrequests (
    changeset INTEGER PRIMARY KEY,
    requested INTEGER NOT NULL DEFAULT 1,
    evaluated INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (changeset) REFERENCES changesets(id) ON DELETE CASCADE
);

-- Permanent job failures
CREATE TABLE IF NOT EXISTS changeseterrors (
    changeset INTEGER NOT NULL,
    job_key TEXT NOT NULL,
    fatal INTEGER NOT NULL,
    traceback TEXT NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (changeset, job_key),
    FOREIGN KEY (changeset) REFERENCES changesets(id) ON DELETE CASCADE
);

-- Interned highlight language labels
CREATE TABLE IF NOT EXISTS highlightlanguages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL UNIQUE
);

-- Content-addressed highlight artefacts
CREATE TABLE IF NOT EXISTS highlightfiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository INTEGER NOT NULL,
    sha1 TEXT NOT NULL,
    language INTEGER NOT NULL,
    conflicts INTEGER NOT NULL DEFAULT 0,
    highlighted INTEGER NOT NULL DEFAULT 0,
    requested INTEGER NOT NULL DEFAULT 0,
    UNIQUE (repository, sha1, language, conflicts),
    FOREIGN KEY (repository) REFERENCES repositories(id),
    FOREIGN KEY (language) REFERENCES highlightlanguages(id)
);

CREATE INDEX IF NOT EXISTS idx_highlightfiles_requested ON highlightfiles(requested, highlighted);

-- Packed per-line token streams
CREATE TABLE IF NOT EXISTS highlightlines (
    file INTEGER NOT NULL,
    line INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (file, line),
    FOREIGN KEY (file) REFERENCES highlightfiles(id) ON DELETE CASCADE
);

-- Structural context labels
CREATE TABLE IF NOT EXISTS codecontexts (
    sha1 TEXT NOT NULL,
    language INTEGER NOT NULL,
    first_line INTEGER NOT NULL,
    last_line INTEGER NOT NULL,
    context TEXT NOT NULL,
    PRIMARY KEY (sha1, language, first_line, last_line),
    FOREIGN KEY (language) REFERENCES highlightlanguages(id)
);

-- Durable pub/sub subscriptions
CREATE TABLE IF NOT EXISTS pubsubreservations (
    reservation_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (reservation_id, channel)
);

CREATE TABLE IF NOT EXISTS pubsubmessages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS pubsubreservedmessages (
    reservation_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    message INTEGER NOT NULL,
    PRIMARY KEY (reservation_id, channel, message),
    FOREIGN KEY (message) REFERENCES pubsubmessages(id) ON DELETE CASCADE
);

-- Review branches and their updates
CREATE TABLE IF NOT EXISTS branches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository INTEGER NOT NULL,
    name TEXT NOT NULL,
    head TEXT,
    UNIQUE (repository, name),
    FOREIGN KEY (repository) REFERENCES repositories(id)
);

CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository INTEGER NOT NULL,
    branch INTEGER NOT NULL UNIQUE,
    state TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    FOREIGN KEY (repository) REFERENCES repositories(id),
    FOREIGN KEY (branch) REFERENCES branches(id)
);

CREATE TABLE IF NOT EXISTS branchupdates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    branch INTEGER NOT NULL,
    from_head TEXT,
    to_head TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (branch) REFERENCES branches(id)
);

CREATE INDEX IF NOT EXISTS idx_branchupdates_processed ON branchupdates(processed);

CREATE TABLE IF NOT EXISTS reviewchangesets (
    review INTEGER NOT NULL,
    branchupdate INTEGER NOT NULL,
    changeset INTEGER NOT NULL,
    squashed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (review, branchupdate, changeset),
    FOREIGN KEY (review) REFERENCES reviews(id),
    FOREIGN KEY (branchupdate) REFERENCES branchupdates(id),
    FOREIGN KEY (changeset) REFERENCES changesets(id)
);

CREATE TABLE IF NOT EXISTS reviewevents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    review INTEGER NOT NULL,
    branchupdate INTEGER NOT NULL UNIQUE,
    processed INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (review) REFERENCES reviews(id),
    FOREIGN KEY (branchupdate) REFERENCES branchupdates(id)
);
"#;
