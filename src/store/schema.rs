//! Database schema.
//!
//! Monetary columns are TEXT-encoded decimals so values survive a round trip
//! exactly; timestamps are REAL seconds for range queries. The fills trigger
//! keeps `positions.last_updated` in step with incoming executions.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS quotes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    quote_id TEXT NOT NULL UNIQUE,
    timestamp REAL NOT NULL,
    symbol_src TEXT NOT NULL,
    symbol_dst TEXT NOT NULL,
    source_bid_price TEXT NOT NULL,
    source_bid_qty TEXT NOT NULL,
    source_ask_price TEXT NOT NULL,
    source_ask_qty TEXT NOT NULL,
    bid_layers TEXT NOT NULL,
    ask_layers TEXT NOT NULL,
    spread_bps TEXT,
    mid_price TEXT,
    total_spread_bps INTEGER NOT NULL,
    sides_enabled TEXT NOT NULL,
    strategy TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL,
    expires_at REAL,
    bid_order_ids TEXT NOT NULL DEFAULT '[]',
    ask_order_ids TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_quotes_symbol_created
    ON quotes(symbol_dst, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_quotes_status_expires
    ON quotes(status, expires_at);

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    quote_id TEXT REFERENCES quotes(quote_id),
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    price TEXT,
    quantity TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    filled_quantity TEXT NOT NULL DEFAULT '0',
    avg_fill_price TEXT,
    external_order_id TEXT,
    error_message TEXT,
    created_at REAL NOT NULL,
    submitted_at REAL,
    last_updated REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_symbol_status
    ON orders(symbol, status);
CREATE INDEX IF NOT EXISTS idx_orders_external
    ON orders(external_order_id);

CREATE TABLE IF NOT EXISTS fills (
    fill_id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    executed_at REAL NOT NULL,
    trade_id TEXT,
    commission TEXT NOT NULL DEFAULT '0',
    commission_asset TEXT,
    is_maker INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'received',
    created_at REAL NOT NULL,
    processed_at REAL
);

CREATE INDEX IF NOT EXISTS idx_fills_order_executed
    ON fills(order_id, executed_at);
CREATE INDEX IF NOT EXISTS idx_fills_symbol_executed
    ON fills(symbol, executed_at DESC);

CREATE TABLE IF NOT EXISTS positions (
    symbol TEXT PRIMARY KEY,
    quantity TEXT NOT NULL DEFAULT '0',
    avg_entry_price TEXT NOT NULL DEFAULT '0',
    realized_pnl TEXT NOT NULL DEFAULT '0',
    unrealized_pnl TEXT NOT NULL DEFAULT '0',
    last_updated REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS account_balances (
    asset TEXT PRIMARY KEY,
    available TEXT NOT NULL,
    locked TEXT NOT NULL,
    total TEXT NOT NULL,
    updated_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 5,
    next_retry_at REAL,
    error_message TEXT,
    last_error_at REAL,
    created_at REAL NOT NULL,
    processed_at REAL
);

CREATE INDEX IF NOT EXISTS idx_outbox_status_retry
    ON outbox(status, next_retry_at);
CREATE INDEX IF NOT EXISTS idx_outbox_aggregate_created
    ON outbox(aggregate_id, created_at);

CREATE TABLE IF NOT EXISTS trading_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL UNIQUE,
    started_at REAL NOT NULL,
    ended_at REAL,
    config_snapshot TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    error_message TEXT
);

CREATE VIEW IF NOT EXISTS v_active_orders AS
    SELECT * FROM orders WHERE status IN ('pending', 'working');

CREATE VIEW IF NOT EXISTS v_quotes_with_orders AS
    SELECT q.quote_id, q.symbol_dst, q.status AS quote_status,
           q.created_at, q.expires_at,
           o.order_id, o.side, o.status AS order_status,
           o.price, o.quantity, o.external_order_id
    FROM quotes q
    LEFT JOIN orders o ON o.quote_id = q.quote_id;

CREATE TRIGGER IF NOT EXISTS trg_fills_touch_position
AFTER INSERT ON fills
BEGIN
    UPDATE positions SET last_updated = NEW.executed_at
    WHERE symbol = NEW.symbol;
END;
"#;

/// Views dropped before a destructive migration, in dependency order.
pub const DROP_VIEWS: &[&str] = &[
    "DROP VIEW IF EXISTS v_active_orders",
    "DROP VIEW IF EXISTS v_quotes_with_orders",
];

/// Tables dropped before a destructive migration, children first.
pub const DROP_TABLES: &[&str] = &[
    "DROP TRIGGER IF EXISTS trg_fills_touch_position",
    "DROP TABLE IF EXISTS fills",
    "DROP TABLE IF EXISTS orders",
    "DROP TABLE IF EXISTS quotes",
    "DROP TABLE IF EXISTS outbox",
    "DROP TABLE IF EXISTS positions",
    "DROP TABLE IF EXISTS account_balances",
    "DROP TABLE IF EXISTS trading_sessions",
];
