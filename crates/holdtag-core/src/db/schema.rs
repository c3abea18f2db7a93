//! Canonical SQLite schema for the hold-tag store.
//!
//! - `hold_tags` keeps the current record of each hold tag
//! - `qr_labels` is the current-binding projection, one row per physical label
//! - `label_assignments` is the append-only binding history
//! - `events` is the hash-chained audit log every mutation appends to
//! - `store_meta` tracks schema version and rebuild state

/// Migration v1: core tables plus store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS hold_tags (
    tag_id TEXT PRIMARY KEY,
    tag_number TEXT NOT NULL UNIQUE,
    tag_date TEXT NOT NULL,
    product TEXT NOT NULL CHECK (length(trim(product)) > 0),
    size TEXT NOT NULL DEFAULT '',
    code TEXT NOT NULL DEFAULT '',
    location TEXT NOT NULL DEFAULT '',
    pallet_tag TEXT NOT NULL DEFAULT '',
    amount INTEGER NOT NULL CHECK (amount > 0),
    formula TEXT NOT NULL DEFAULT '',
    upc TEXT NOT NULL DEFAULT '',
    reason TEXT NOT NULL CHECK (length(trim(reason)) > 0),
    shift TEXT NOT NULL CHECK (shift IN ('A', 'B', 'C', 'D')),
    disposition TEXT NOT NULL DEFAULT '',
    outcome TEXT CHECK (outcome IS NULL OR outcome IN ('pending', 'release', 'rework', 'destroy')),
    signed_by TEXT,
    qc_date TEXT,
    latest_disposition TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
    version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
    created_by TEXT NOT NULL,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    closed_at_us INTEGER,
    closed_by TEXT,
    CHECK (tag_id LIKE 'ht-%'),
    CHECK (
        (status = 'open' AND closed_at_us IS NULL AND closed_by IS NULL)
        OR (status = 'closed' AND closed_at_us IS NOT NULL AND closed_by IS NOT NULL)
    )
);

CREATE TABLE IF NOT EXISTS qr_labels (
    qr_id TEXT PRIMARY KEY CHECK (length(qr_id) BETWEEN 1 AND 128),
    current_tag_id TEXT REFERENCES hold_tags(tag_id),
    assigned_at_us INTEGER,
    assigned_by TEXT,
    version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
    registered_by TEXT NOT NULL,
    created_at_us INTEGER NOT NULL,
    CHECK (
        (current_tag_id IS NULL AND assigned_at_us IS NULL AND assigned_by IS NULL)
        OR (current_tag_id IS NOT NULL AND assigned_at_us IS NOT NULL AND assigned_by IS NOT NULL)
    )
);

CREATE TABLE IF NOT EXISTS label_assignments (
    assignment_id INTEGER PRIMARY KEY AUTOINCREMENT,
    qr_id TEXT NOT NULL REFERENCES qr_labels(qr_id),
    tag_id TEXT NOT NULL REFERENCES hold_tags(tag_id),
    assigned_at_us INTEGER NOT NULL,
    assigned_by TEXT NOT NULL,
    unassigned_at_us INTEGER NOT NULL,
    unassigned_by TEXT NOT NULL,
    reason TEXT,
    CHECK (unassigned_at_us >= assigned_at_us)
);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    wall_ts_us INTEGER NOT NULL,
    actor TEXT NOT NULL,
    event_type TEXT NOT NULL CHECK (event_type IN (
        'tag.create', 'tag.disposition', 'tag.close',
        'label.register', 'label.bind', 'label.unbind'
    )),
    entity_id TEXT NOT NULL,
    data_json TEXT NOT NULL,
    prev_hash TEXT,
    event_hash TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    rebuilding INTEGER NOT NULL DEFAULT 0 CHECK (rebuilding IN (0, 1)),
    last_rebuild_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (
    id,
    schema_version,
    rebuilding,
    last_rebuild_at_us
) VALUES (1, 1, 0, 0);
";

/// Migration v2: lookup indexes, the tag -> label uniqueness index, and
/// integrity triggers.
pub const MIGRATION_V2_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_qr_labels_current_tag
    ON qr_labels(current_tag_id)
    WHERE current_tag_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_label_assignments_qr
    ON label_assignments(qr_id, assignment_id);

CREATE INDEX IF NOT EXISTS idx_label_assignments_tag
    ON label_assignments(tag_id, assigned_at_us);

CREATE INDEX IF NOT EXISTS idx_hold_tags_status_created
    ON hold_tags(status, created_at_us DESC);

CREATE INDEX IF NOT EXISTS idx_hold_tags_shift
    ON hold_tags(shift, status);

CREATE INDEX IF NOT EXISTS idx_events_entity
    ON events(entity_id, seq);

CREATE TRIGGER IF NOT EXISTS events_no_update
BEFORE UPDATE ON events
BEGIN
    SELECT RAISE(ABORT, 'events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS events_no_delete
BEFORE DELETE ON events
BEGIN
    SELECT RAISE(ABORT, 'events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS label_assignments_no_update
BEFORE UPDATE ON label_assignments
BEGIN
    SELECT RAISE(ABORT, 'label history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS label_assignments_no_delete
BEFORE DELETE ON label_assignments
WHEN (SELECT rebuilding FROM store_meta WHERE id = 1) = 0
BEGIN
    SELECT RAISE(ABORT, 'label history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS hold_tags_no_delete
BEFORE DELETE ON hold_tags
BEGIN
    SELECT RAISE(ABORT, 'hold tags are retained for audit');
END;

CREATE TRIGGER IF NOT EXISTS hold_tags_closed_immutable
BEFORE UPDATE ON hold_tags
WHEN OLD.status = 'closed' AND (
    NEW.status IS NOT OLD.status
    OR NEW.tag_number IS NOT OLD.tag_number
    OR NEW.tag_date IS NOT OLD.tag_date
    OR NEW.product IS NOT OLD.product
    OR NEW.size IS NOT OLD.size
    OR NEW.code IS NOT OLD.code
    OR NEW.location IS NOT OLD.location
    OR NEW.pallet_tag IS NOT OLD.pallet_tag
    OR NEW.amount IS NOT OLD.amount
    OR NEW.formula IS NOT OLD.formula
    OR NEW.upc IS NOT OLD.upc
    OR NEW.reason IS NOT OLD.reason
    OR NEW.shift IS NOT OLD.shift
    OR NEW.disposition IS NOT OLD.disposition
    OR NEW.outcome IS NOT OLD.outcome
    OR NEW.signed_by IS NOT OLD.signed_by
    OR NEW.qc_date IS NOT OLD.qc_date
    OR NEW.latest_disposition IS NOT OLD.latest_disposition
    OR NEW.closed_at_us IS NOT OLD.closed_at_us
    OR NEW.closed_by IS NOT OLD.closed_by
)
BEGIN
    SELECT RAISE(ABORT, 'closed hold tags are immutable');
END;

CREATE TRIGGER IF NOT EXISTS qr_labels_no_bind_closed
BEFORE UPDATE OF current_tag_id ON qr_labels
WHEN NEW.current_tag_id IS NOT NULL
    AND (SELECT status FROM hold_tags WHERE tag_id = NEW.current_tag_id) = 'closed'
BEGIN
    SELECT RAISE(ABORT, 'cannot bind a label to a closed hold tag');
END;
";

/// Indexes expected after all migrations are applied.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_qr_labels_current_tag",
    "idx_label_assignments_qr",
    "idx_label_assignments_tag",
    "idx_hold_tags_status_created",
    "idx_hold_tags_shift",
    "idx_events_entity",
];

/// Triggers expected after all migrations are applied.
pub const REQUIRED_TRIGGERS: &[&str] = &[
    "events_no_update",
    "events_no_delete",
    "label_assignments_no_update",
    "label_assignments_no_delete",
    "hold_tags_no_delete",
    "hold_tags_closed_immutable",
    "qr_labels_no_bind_closed",
];
