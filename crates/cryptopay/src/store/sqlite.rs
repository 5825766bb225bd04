use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    EndpointHealth, PaymentChange, PaymentCreation, PaymentRepository, RateRepository,
    SweepCursor, SweepLock, WebhookRepository,
};
use crate::error::{PaymentError, Result};
use crate::types::{
    utc_now, AddressRegistration, AuditEntry, ExchangeRate, Payment, PaymentMethod,
    PaymentStatus, WebhookEndpoint, WebhookEvent,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS payments (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT UNIQUE NOT NULL,
    reference_code TEXT UNIQUE NOT NULL,
    merchant_id TEXT,
    order_id TEXT,
    description TEXT,
    payment_method TEXT NOT NULL,
    currency TEXT NOT NULL,
    amount_crypto TEXT NOT NULL,
    amount_fiat TEXT NOT NULL,
    fiat_currency TEXT NOT NULL,
    wallet_address TEXT NOT NULL,
    transaction_hash TEXT,
    status TEXT NOT NULL,
    confirmations INTEGER NOT NULL DEFAULT 0,
    required_confirmations INTEGER NOT NULL,
    exchange_rate TEXT NOT NULL,
    network_fee TEXT,
    platform_fee TEXT NOT NULL,
    fee_percentage TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    paid_at INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_payments_merchant ON payments(merchant_id);
CREATE INDEX IF NOT EXISTS idx_payments_transaction ON payments(transaction_hash);

CREATE TABLE IF NOT EXISTS crypto_addresses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL,
    currency TEXT NOT NULL,
    merchant_id TEXT,
    label TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    UNIQUE(address, currency)
);

CREATE TABLE IF NOT EXISTS webhook_endpoints (
    id TEXT PRIMARY KEY,
    merchant_id TEXT NOT NULL,
    url TEXT NOT NULL,
    secret TEXT NOT NULL,
    events TEXT NOT NULL,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_triggered_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_webhook_endpoints_merchant ON webhook_endpoints(merchant_id, is_active);

CREATE TABLE IF NOT EXISTS webhook_events (
    id TEXT PRIMARY KEY,
    payment_id TEXT REFERENCES payments(id) ON DELETE CASCADE,
    endpoint_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    webhook_url TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 1,
    max_attempts INTEGER NOT NULL,
    next_retry_at INTEGER,
    response_code INTEGER,
    response_body TEXT,
    completed_at INTEGER,
    failed_at INTEGER,
    created_at INTEGER NOT NULL,
    CHECK (completed_at IS NULL OR failed_at IS NULL)
);
CREATE INDEX IF NOT EXISTS idx_webhook_events_open ON webhook_events(completed_at, failed_at);
CREATE INDEX IF NOT EXISTS idx_webhook_events_payment ON webhook_events(payment_id);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payment_id TEXT NOT NULL REFERENCES payments(id) ON DELETE CASCADE,
    action TEXT NOT NULL,
    changes TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_payment ON audit_logs(payment_id);

CREATE TABLE IF NOT EXISTS exchange_rates (
    crypto_currency TEXT NOT NULL,
    fiat_currency TEXT NOT NULL,
    rate TEXT NOT NULL,
    source TEXT NOT NULL,
    volume_24h TEXT,
    market_cap TEXT,
    change_24h TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (crypto_currency, fiat_currency)
);

CREATE TABLE IF NOT EXISTS scheduler_locks (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const PAYMENT_COLUMNS: &str = "seq, id, reference_code, merchant_id, order_id, description, \
     payment_method, currency, amount_crypto, amount_fiat, fiat_currency, wallet_address, \
     transaction_hash, status, confirmations, required_confirmations, exchange_rate, \
     network_fee, platform_fee, fee_percentage, expires_at, paid_at, metadata, created_at, \
     updated_at, version";

const ENDPOINT_COLUMNS: &str = "id, merchant_id, url, secret, events, description, is_active, \
     consecutive_failures, last_triggered_at, created_at";

const EVENT_COLUMNS: &str = "id, payment_id, endpoint_id, event_type, webhook_url, payload, \
     attempt, max_attempts, next_retry_at, response_code, response_body, completed_at, \
     failed_at, created_at";

const RATE_COLUMNS: &str = "crypto_currency, fiat_currency, rate, source, volume_24h, \
     market_cap, change_24h, updated_at";

/// SQLite-backed implementation of every repository trait.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PaymentError::Internal("database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run raw SQL against the connection (maintenance and tests).
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn opt_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(millis)
}

fn conversion_err(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn get_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
    })
    .transpose()
}

fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn get_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Decimal::from_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))
}

fn get_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<(SweepCursor, Payment)> {
    let method: String = row.get(6)?;
    let status: String = row.get(13)?;
    let payment = Payment {
        id: get_uuid(row, 1)?,
        reference_code: row.get(2)?,
        merchant_id: row.get(3)?,
        order_id: row.get(4)?,
        description: row.get(5)?,
        payment_method: PaymentMethod::parse(&method)
            .ok_or_else(|| conversion_err(6, format!("unknown payment method {method}")))?,
        currency: row.get(7)?,
        amount_crypto: get_decimal(row, 8)?,
        amount_fiat: get_decimal(row, 9)?,
        fiat_currency: row.get(10)?,
        wallet_address: row.get(11)?,
        transaction_hash: row.get(12)?,
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| conversion_err(13, format!("unknown status {status}")))?,
        confirmations: row.get(14)?,
        required_confirmations: row.get(15)?,
        exchange_rate: get_decimal(row, 16)?,
        network_fee: get_opt_decimal(row, 17)?,
        platform_fee: get_decimal(row, 18)?,
        fee_percentage: get_decimal(row, 19)?,
        expires_at: get_time(row, 20)?,
        paid_at: get_opt_time(row, 21)?,
        metadata: get_json(row, 22)?,
        created_at: get_time(row, 23)?,
        updated_at: get_time(row, 24)?,
        version: row.get(25)?,
    };
    Ok((row.get(0)?, payment))
}

fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookEndpoint> {
    Ok(WebhookEndpoint {
        id: get_uuid(row, 0)?,
        merchant_id: row.get(1)?,
        url: row.get(2)?,
        secret: row.get(3)?,
        events: get_json(row, 4)?,
        description: row.get(5)?,
        is_active: row.get::<_, i32>(6)? == 1,
        consecutive_failures: row.get(7)?,
        last_triggered_at: get_opt_time(row, 8)?,
        created_at: get_time(row, 9)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookEvent> {
    Ok(WebhookEvent {
        id: get_uuid(row, 0)?,
        payment_id: get_opt_uuid(row, 1)?,
        endpoint_id: get_uuid(row, 2)?,
        event_type: row.get(3)?,
        webhook_url: row.get(4)?,
        payload: get_json(row, 5)?,
        attempt: row.get(6)?,
        max_attempts: row.get(7)?,
        next_retry_at: get_opt_time(row, 8)?,
        response_code: row.get(9)?,
        response_body: row.get(10)?,
        completed_at: get_opt_time(row, 11)?,
        failed_at: get_opt_time(row, 12)?,
        created_at: get_time(row, 13)?,
    })
}

fn rate_from_row(row: &Row<'_>) -> rusqlite::Result<ExchangeRate> {
    Ok(ExchangeRate {
        crypto_currency: row.get(0)?,
        fiat_currency: row.get(1)?,
        rate: get_decimal(row, 2)?,
        source: row.get(3)?,
        volume_24h: get_opt_decimal(row, 4)?,
        market_cap: get_opt_decimal(row, 5)?,
        change_24h: get_opt_decimal(row, 6)?,
        updated_at: get_time(row, 7)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    // SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == 2067 || err.extended_code == 1555
    )
}

fn insert_event(conn: &Connection, event: &WebhookEvent) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO webhook_events (id, payment_id, endpoint_id, event_type, webhook_url, payload,
            attempt, max_attempts, next_retry_at, response_code, response_body, completed_at,
            failed_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            event.id.to_string(),
            event.payment_id.map(|id| id.to_string()),
            event.endpoint_id.to_string(),
            event.event_type,
            event.webhook_url,
            event.payload.to_string(),
            event.attempt,
            event.max_attempts,
            opt_millis(event.next_retry_at),
            event.response_code,
            event.response_body,
            opt_millis(event.completed_at),
            opt_millis(event.failed_at),
            millis(event.created_at),
        ],
    )?;
    conn.execute(
        "UPDATE webhook_endpoints SET last_triggered_at = ?1 WHERE id = ?2",
        params![millis(event.created_at), event.endpoint_id.to_string()],
    )?;
    Ok(())
}

fn insert_audit(conn: &Connection, entry: &AuditEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_logs (payment_id, action, changes, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.payment_id.to_string(),
            entry.action,
            entry.changes.to_string(),
            millis(entry.created_at),
        ],
    )?;
    Ok(())
}

impl PaymentRepository for Database {
    fn create_payment(&self, creation: &PaymentCreation) -> Result<()> {
        let conn = self.lock()?;
        let p = &creation.payment;
        let metadata = serde_json::to_string(&p.metadata)?;

        let write = || -> rusqlite::Result<()> {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                r#"
                INSERT INTO payments (id, reference_code, merchant_id, order_id, description,
                    payment_method, currency, amount_crypto, amount_fiat, fiat_currency,
                    wallet_address, transaction_hash, status, confirmations,
                    required_confirmations, exchange_rate, network_fee, platform_fee,
                    fee_percentage, expires_at, paid_at, metadata, created_at, updated_at, version)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
                "#,
                params![
                    p.id.to_string(),
                    p.reference_code,
                    p.merchant_id,
                    p.order_id,
                    p.description,
                    p.payment_method.as_str(),
                    p.currency,
                    p.amount_crypto.to_string(),
                    p.amount_fiat.to_string(),
                    p.fiat_currency,
                    p.wallet_address,
                    p.transaction_hash,
                    p.status.as_str(),
                    p.confirmations,
                    p.required_confirmations,
                    p.exchange_rate.to_string(),
                    p.network_fee.map(|f| f.to_string()),
                    p.platform_fee.to_string(),
                    p.fee_percentage.to_string(),
                    millis(p.expires_at),
                    opt_millis(p.paid_at),
                    metadata,
                    millis(p.created_at),
                    millis(p.updated_at),
                    p.version,
                ],
            )?;

            let a = &creation.address;
            tx.execute(
                r#"
                INSERT INTO crypto_addresses (address, currency, merchant_id, label, is_active, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(address, currency) DO NOTHING
                "#,
                params![
                    a.address,
                    a.currency,
                    a.merchant_id,
                    a.label,
                    a.is_active as i32,
                    millis(p.created_at),
                ],
            )?;

            for event in &creation.events {
                insert_event(&tx, event)?;
            }
            for entry in &creation.audit {
                insert_audit(&tx, entry)?;
            }
            tx.commit()
        };

        write().map_err(|e| {
            if is_unique_violation(&e) {
                PaymentError::Conflict(format!("payment {}: {e}", p.reference_code))
            } else {
                PaymentError::Database(e)
            }
        })
    }

    fn save_payment(&self, change: &PaymentChange) -> Result<Payment> {
        let conn = self.lock()?;
        let p = &change.payment;
        let metadata = serde_json::to_string(&p.metadata)?;

        let write = || -> rusqlite::Result<usize> {
            let tx = conn.unchecked_transaction()?;
            let updated = tx.execute(
                r#"
                UPDATE payments SET
                    transaction_hash = ?1,
                    status = ?2,
                    confirmations = MAX(confirmations, ?3),
                    network_fee = ?4,
                    paid_at = ?5,
                    metadata = ?6,
                    updated_at = ?7,
                    version = version + 1
                WHERE id = ?8 AND version = ?9 AND deleted_at IS NULL
                "#,
                params![
                    p.transaction_hash,
                    p.status.as_str(),
                    p.confirmations,
                    p.network_fee.map(|f| f.to_string()),
                    opt_millis(p.paid_at),
                    metadata,
                    millis(p.updated_at),
                    p.id.to_string(),
                    p.version,
                ],
            )?;
            if updated == 0 {
                return Ok(0);
            }
            for event in &change.events {
                insert_event(&tx, event)?;
            }
            for entry in &change.audit {
                insert_audit(&tx, entry)?;
            }
            tx.commit()?;
            Ok(updated)
        };

        match write() {
            Ok(0) => Err(PaymentError::Conflict(format!(
                "payment {} changed since version {}",
                p.id, p.version
            ))),
            Ok(_) => {
                let mut saved = p.clone();
                saved.version += 1;
                Ok(saved)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1 AND deleted_at IS NULL"
        );
        let found = conn
            .query_row(&sql, params![id.to_string()], payment_from_row)
            .optional()?;
        Ok(found.map(|(_, p)| p))
    }

    fn find_by_reference(&self, reference_code: &str) -> Result<Option<Payment>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE reference_code = ?1 AND deleted_at IS NULL"
        );
        let found = conn
            .query_row(&sql, params![reference_code], payment_from_row)
            .optional()?;
        Ok(found.map(|(_, p)| p))
    }

    fn due_for_reconciliation(
        &self,
        now: DateTime<Utc>,
        confirming_grace: Duration,
        after: SweepCursor,
        limit: usize,
    ) -> Result<Vec<(SweepCursor, Payment)>> {
        let conn = self.lock()?;
        let grace_ms = i64::try_from(confirming_grace.as_millis()).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE deleted_at IS NULL
              AND seq > ?1
              AND (status = 'pending'
                   OR (status = 'confirming' AND expires_at > ?2 - ?3))
            ORDER BY seq
            LIMIT ?4
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![after, millis(now), grace_ms, limit], payment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn audit_trail(&self, payment_id: Uuid) -> Result<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT payment_id, action, changes, created_at FROM audit_logs \
             WHERE payment_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![payment_id.to_string()], |row| {
                Ok(AuditEntry {
                    payment_id: get_uuid(row, 0)?,
                    action: row.get(1)?,
                    changes: get_json(row, 2)?,
                    created_at: get_time(row, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn address(&self, address: &str, currency: &str) -> Result<Option<AddressRegistration>> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT address, currency, merchant_id, label, is_active FROM crypto_addresses \
                 WHERE address = ?1 AND currency = ?2",
                params![address, currency],
                |row| {
                    Ok(AddressRegistration {
                        address: row.get(0)?,
                        currency: row.get(1)?,
                        merchant_id: row.get(2)?,
                        label: row.get(3)?,
                        is_active: row.get::<_, i32>(4)? == 1,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    fn soft_delete_payment(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE payments SET deleted_at = ?1, version = version + 1 \
             WHERE id = ?2 AND deleted_at IS NULL",
            params![millis(utc_now()), id.to_string()],
        )?;
        if updated == 0 {
            return Err(PaymentError::NotFound(format!("payment {id}")));
        }
        Ok(())
    }

    fn delete_payment(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM payments WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(PaymentError::NotFound(format!("payment {id}")));
        }
        Ok(())
    }
}

impl WebhookRepository for Database {
    fn insert_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO webhook_endpoints (id, merchant_id, url, secret, events, description,
                is_active, consecutive_failures, last_triggered_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                endpoint.id.to_string(),
                endpoint.merchant_id,
                endpoint.url,
                endpoint.secret,
                serde_json::to_string(&endpoint.events)?,
                endpoint.description,
                endpoint.is_active as i32,
                endpoint.consecutive_failures,
                opt_millis(endpoint.last_triggered_at),
                millis(endpoint.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_endpoint(&self, id: Uuid) -> Result<Option<WebhookEndpoint>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = ?1");
        let found = conn
            .query_row(&sql, params![id.to_string()], endpoint_from_row)
            .optional()?;
        Ok(found)
    }

    fn list_endpoints(&self, merchant_id: &str) -> Result<Vec<WebhookEndpoint>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE merchant_id = ?1 \
             ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let endpoints = stmt
            .query_map(params![merchant_id], endpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(endpoints)
    }

    fn active_endpoints_for(
        &self,
        merchant_id: &str,
        event_type: &str,
    ) -> Result<Vec<WebhookEndpoint>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints \
             WHERE merchant_id = ?1 AND is_active = 1 ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let endpoints = stmt
            .query_map(params![merchant_id], endpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(endpoints
            .into_iter()
            .filter(|e| e.supports_event(event_type))
            .collect())
    }

    fn update_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            r#"
            UPDATE webhook_endpoints SET url = ?1, events = ?2, description = ?3,
                is_active = ?4, consecutive_failures = ?5
            WHERE id = ?6
            "#,
            params![
                endpoint.url,
                serde_json::to_string(&endpoint.events)?,
                endpoint.description,
                endpoint.is_active as i32,
                endpoint.consecutive_failures,
                endpoint.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(PaymentError::NotFound(format!("webhook endpoint {}", endpoint.id)));
        }
        Ok(())
    }

    fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM webhook_endpoints WHERE id = ?1",
            params![id.to_string()],
        )?;
        if deleted == 0 {
            return Err(PaymentError::NotFound(format!("webhook endpoint {id}")));
        }
        Ok(())
    }

    fn insert_events(&self, events: &[WebhookEvent]) -> Result<()> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for event in events {
            insert_event(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_event(&self, id: Uuid) -> Result<Option<WebhookEvent>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE id = ?1");
        let found = conn
            .query_row(&sql, params![id.to_string()], event_from_row)
            .optional()?;
        Ok(found)
    }

    fn events_for_payment(&self, payment_id: Uuid) -> Result<Vec<WebhookEvent>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE payment_id = ?1 \
             ORDER BY created_at, rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![payment_id.to_string()], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn pending_events(&self) -> Result<Vec<WebhookEvent>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events \
             WHERE completed_at IS NULL AND failed_at IS NULL ORDER BY created_at, rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map([], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn mark_delivered(
        &self,
        event_id: Uuid,
        response_code: u16,
        response_body: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let updated = tx.execute(
            r#"
            UPDATE webhook_events SET completed_at = ?1, response_code = ?2,
                response_body = ?3, next_retry_at = NULL
            WHERE id = ?4 AND completed_at IS NULL AND failed_at IS NULL
            "#,
            params![millis(at), response_code, response_body, event_id.to_string()],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute(
            r#"
            UPDATE webhook_endpoints SET consecutive_failures = 0
            WHERE id = (SELECT endpoint_id FROM webhook_events WHERE id = ?1)
            "#,
            params![event_id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn schedule_retry(
        &self,
        event_id: Uuid,
        next_attempt: u32,
        next_retry_at: DateTime<Utc>,
        response_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE webhook_events SET attempt = ?1, next_retry_at = ?2, response_code = ?3,
                response_body = ?4
            WHERE id = ?5 AND completed_at IS NULL AND failed_at IS NULL
            "#,
            params![
                next_attempt,
                millis(next_retry_at),
                response_code,
                error,
                event_id.to_string(),
            ],
        )?;
        Ok(())
    }

    fn mark_dropped(&self, event_id: Uuid, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            r#"
            UPDATE webhook_events SET failed_at = ?1, response_body = ?2, next_retry_at = NULL
            WHERE id = ?3 AND completed_at IS NULL AND failed_at IS NULL
            "#,
            params![millis(at), reason, event_id.to_string()],
        )?;
        Ok(updated == 1)
    }

    fn mark_failed(
        &self,
        event_id: Uuid,
        response_code: Option<u16>,
        error: Option<&str>,
        at: DateTime<Utc>,
        threshold: u32,
    ) -> Result<Option<EndpointHealth>> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let endpoint_id: Option<String> = tx
            .query_row(
                "SELECT endpoint_id FROM webhook_events \
                 WHERE id = ?1 AND completed_at IS NULL AND failed_at IS NULL",
                params![event_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(endpoint_id) = endpoint_id else {
            return Ok(None);
        };

        tx.execute(
            r#"
            UPDATE webhook_events SET failed_at = ?1, response_code = ?2, response_body = ?3,
                next_retry_at = NULL
            WHERE id = ?4
            "#,
            params![millis(at), response_code, error, event_id.to_string()],
        )?;
        tx.execute(
            "UPDATE webhook_endpoints SET consecutive_failures = consecutive_failures + 1 \
             WHERE id = ?1",
            params![endpoint_id],
        )?;

        let state: Option<(u32, bool)> = tx
            .query_row(
                "SELECT consecutive_failures, is_active FROM webhook_endpoints WHERE id = ?1",
                params![endpoint_id],
                |row| Ok((row.get(0)?, row.get::<_, i32>(1)? == 1)),
            )
            .optional()?;

        let health = match state {
            Some((failures, true)) if failures >= threshold => {
                tx.execute(
                    "UPDATE webhook_endpoints SET is_active = 0 WHERE id = ?1",
                    params![endpoint_id],
                )?;
                EndpointHealth {
                    consecutive_failures: failures,
                    deactivated: true,
                }
            }
            Some((failures, _)) => EndpointHealth {
                consecutive_failures: failures,
                deactivated: false,
            },
            None => EndpointHealth {
                consecutive_failures: 0,
                deactivated: false,
            },
        };
        tx.commit()?;
        Ok(Some(health))
    }
}

impl RateRepository for Database {
    fn latest_rate(&self, crypto: &str, fiat: &str) -> Result<Option<ExchangeRate>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RATE_COLUMNS} FROM exchange_rates \
             WHERE crypto_currency = ?1 AND fiat_currency = ?2"
        );
        let found = conn
            .query_row(&sql, params![crypto, fiat], rate_from_row)
            .optional()?;
        Ok(found)
    }

    fn upsert_rate(&self, rate: &ExchangeRate) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO exchange_rates (crypto_currency, fiat_currency, rate, source,
                volume_24h, market_cap, change_24h, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(crypto_currency, fiat_currency) DO UPDATE SET
                rate = excluded.rate,
                source = excluded.source,
                volume_24h = excluded.volume_24h,
                market_cap = excluded.market_cap,
                change_24h = excluded.change_24h,
                updated_at = excluded.updated_at
            "#,
            params![
                rate.crypto_currency,
                rate.fiat_currency,
                rate.rate.to_string(),
                rate.source,
                rate.volume_24h.map(|d| d.to_string()),
                rate.market_cap.map(|d| d.to_string()),
                rate.change_24h.map(|d| d.to_string()),
                millis(rate.updated_at),
            ],
        )?;
        Ok(())
    }
}

impl SweepLock for Database {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let conn = self.lock()?;
        let now = millis(utc_now());
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let changed = conn.execute(
            r#"
            INSERT INTO scheduler_locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE scheduler_locks.expires_at <= ?4 OR scheduler_locks.holder = excluded.holder
            "#,
            params![name, holder, now.saturating_add(ttl_ms), now],
        )?;
        Ok(changed > 0)
    }

    fn release(&self, name: &str, holder: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM scheduler_locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use serde_json::{json, Map};

    fn sample_payment(reference: &str) -> Payment {
        let now = utc_now();
        Payment {
            id: Uuid::new_v4(),
            reference_code: reference.to_string(),
            merchant_id: Some("merchant-1".into()),
            order_id: Some("order-9".into()),
            description: None,
            payment_method: PaymentMethod::Native,
            currency: "BTC".into(),
            amount_crypto: dec!(0.002),
            amount_fiat: dec!(100),
            fiat_currency: "USD".into(),
            wallet_address: format!("bc1q{reference}"),
            transaction_hash: None,
            status: PaymentStatus::Pending,
            confirmations: 0,
            required_confirmations: 3,
            exchange_rate: dec!(50000),
            network_fee: None,
            platform_fee: dec!(0),
            fee_percentage: dec!(0),
            expires_at: now + ChronoDuration::minutes(15),
            paid_at: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    fn creation(payment: Payment) -> PaymentCreation {
        PaymentCreation {
            address: AddressRegistration {
                address: payment.wallet_address.clone(),
                currency: payment.currency.clone(),
                merchant_id: payment.merchant_id.clone(),
                label: format!("Payment {}", payment.reference_code),
                is_active: true,
            },
            events: vec![],
            audit: vec![AuditEntry::new(payment.id, "payment_created", json!({}))],
            payment,
        }
    }

    fn sample_endpoint(merchant: &str, events: &[&str]) -> WebhookEndpoint {
        WebhookEndpoint {
            id: Uuid::new_v4(),
            merchant_id: merchant.to_string(),
            url: "https://merchant.example/hook".into(),
            secret: "s3cret".into(),
            events: events.iter().map(|e| e.to_string()).collect(),
            description: None,
            is_active: true,
            consecutive_failures: 0,
            last_triggered_at: None,
            created_at: utc_now(),
        }
    }

    fn sample_event(endpoint: &WebhookEndpoint, payment_id: Option<Uuid>) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            payment_id,
            endpoint_id: endpoint.id,
            event_type: "payment_created".into(),
            webhook_url: endpoint.url.clone(),
            payload: json!({"event": "payment_created"}),
            attempt: 1,
            max_attempts: 3,
            next_retry_at: None,
            response_code: None,
            response_body: None,
            completed_at: None,
            failed_at: None,
            created_at: utc_now(),
        }
    }

    #[test]
    fn test_create_and_get_payment() {
        let db = Database::new(":memory:").unwrap();
        let payment = sample_payment("B0001");
        db.create_payment(&creation(payment.clone())).unwrap();

        let fetched = db.get_payment(payment.id).unwrap().unwrap();
        assert_eq!(fetched, payment);
        let by_ref = db.find_by_reference("B0001").unwrap().unwrap();
        assert_eq!(by_ref.id, payment.id);

        let address = db.address(&payment.wallet_address, "BTC").unwrap().unwrap();
        assert_eq!(address.label, "Payment B0001");
        assert_eq!(db.audit_trail(payment.id).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_reference_is_conflict() {
        let db = Database::new(":memory:").unwrap();
        db.create_payment(&creation(sample_payment("DUP"))).unwrap();
        let err = db.create_payment(&creation(sample_payment("DUP"))).unwrap_err();
        assert!(matches!(err, PaymentError::Conflict(_)));
    }

    #[test]
    fn test_address_registered_once() {
        let db = Database::new(":memory:").unwrap();
        let first = sample_payment("A1");
        let mut second = sample_payment("A2");
        second.wallet_address = first.wallet_address.clone();
        db.create_payment(&creation(first.clone())).unwrap();
        db.create_payment(&creation(second)).unwrap();

        let label = db.address(&first.wallet_address, "BTC").unwrap().unwrap().label;
        assert_eq!(label, "Payment A1");
    }

    #[test]
    fn test_stale_version_is_rejected() {
        let db = Database::new(":memory:").unwrap();
        let payment = sample_payment("V1");
        db.create_payment(&creation(payment.clone())).unwrap();

        let mut first = payment.clone();
        first.status = PaymentStatus::Confirming;
        first.transaction_hash = Some("tx-1".into());
        let saved = db
            .save_payment(&PaymentChange {
                payment: first,
                events: vec![],
                audit: vec![],
            })
            .unwrap();
        assert_eq!(saved.version, 1);

        let mut stale = payment;
        stale.status = PaymentStatus::Expired;
        let err = db
            .save_payment(&PaymentChange {
                payment: stale,
                events: vec![],
                audit: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, PaymentError::Conflict(_)));

        let stored = db.get_payment(saved.id).unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Confirming);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_batched_transaction_pays_several_payments() {
        let db = Database::new(":memory:").unwrap();
        let a = sample_payment("T1");
        let mut b = sample_payment("T2");
        b.wallet_address = "bc1qsecondaddress".into();
        db.create_payment(&creation(a.clone())).unwrap();
        db.create_payment(&creation(b.clone())).unwrap();

        for payment in [a, b] {
            let mut seen = payment;
            seen.transaction_hash = Some("batched-tx".into());
            seen.status = PaymentStatus::Confirming;
            db.save_payment(&PaymentChange {
                payment: seen,
                events: vec![],
                audit: vec![],
            })
            .unwrap();
        }

        for reference in ["T1", "T2"] {
            let stored = db.find_by_reference(reference).unwrap().unwrap();
            assert_eq!(stored.transaction_hash.as_deref(), Some("batched-tx"));
            assert_eq!(stored.status, PaymentStatus::Confirming);
        }
    }

    #[test]
    fn test_confirmations_never_decrease_in_storage() {
        let db = Database::new(":memory:").unwrap();
        let mut payment = sample_payment("C1");
        db.create_payment(&creation(payment.clone())).unwrap();

        payment.confirmations = 5;
        let saved = db
            .save_payment(&PaymentChange {
                payment: payment.clone(),
                events: vec![],
                audit: vec![],
            })
            .unwrap();

        let mut lower = saved;
        lower.confirmations = 2;
        db.save_payment(&PaymentChange {
            payment: lower,
            events: vec![],
            audit: vec![],
        })
        .unwrap();
        assert_eq!(db.get_payment(payment.id).unwrap().unwrap().confirmations, 5);
    }

    #[test]
    fn test_due_for_reconciliation_selection() {
        let db = Database::new(":memory:").unwrap();
        let now = utc_now();
        let grace = Duration::from_secs(60 * 60);

        let pending_expired = sample_payment("P-OLD");
        let mut confirming_recent = sample_payment("C-NEW");
        confirming_recent.status = PaymentStatus::Confirming;
        let mut confirming_stale = sample_payment("C-OLD");
        confirming_stale.status = PaymentStatus::Confirming;
        let mut completed = sample_payment("DONE");
        completed.status = PaymentStatus::Completed;

        for p in [&pending_expired, &confirming_recent, &confirming_stale, &completed] {
            db.create_payment(&creation(p.clone())).unwrap();
        }
        let backdate = |id: Uuid, minutes: i64| {
            let at = millis(now - ChronoDuration::minutes(minutes));
            db.with_connection(|conn| {
                conn.execute(
                    "UPDATE payments SET expires_at = ?1 WHERE id = ?2",
                    params![at, id.to_string()],
                )
            })
            .unwrap();
        };
        backdate(pending_expired.id, 16);
        backdate(confirming_stale.id, 61);

        let due: Vec<Uuid> = db
            .due_for_reconciliation(now, grace, 0, 100)
            .unwrap()
            .into_iter()
            .map(|(_, p)| p.id)
            .collect();
        assert_eq!(due, vec![pending_expired.id, confirming_recent.id]);
    }

    #[test]
    fn test_due_for_reconciliation_pages_by_cursor() {
        let db = Database::new(":memory:").unwrap();
        for i in 0..5 {
            db.create_payment(&creation(sample_payment(&format!("PG{i}"))))
                .unwrap();
        }
        let grace = Duration::from_secs(3600);
        let first = db.due_for_reconciliation(utc_now(), grace, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first.last().unwrap().0;
        let rest = db
            .due_for_reconciliation(utc_now(), grace, cursor, 10)
            .unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|(seq, _)| *seq > cursor));
    }

    #[test]
    fn test_soft_delete_hides_payment() {
        let db = Database::new(":memory:").unwrap();
        let payment = sample_payment("SD1");
        db.create_payment(&creation(payment.clone())).unwrap();
        db.soft_delete_payment(payment.id).unwrap();

        assert!(db.get_payment(payment.id).unwrap().is_none());
        assert!(db
            .due_for_reconciliation(utc_now(), Duration::from_secs(60), 0, 10)
            .unwrap()
            .is_empty());
        assert!(matches!(
            db.soft_delete_payment(payment.id),
            Err(PaymentError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_cascades_to_events_and_audit() {
        let db = Database::new(":memory:").unwrap();
        let endpoint = sample_endpoint("merchant-1", &["payment_created"]);
        db.insert_endpoint(&endpoint).unwrap();

        let payment = sample_payment("DEL1");
        let mut create = creation(payment.clone());
        create.events.push(sample_event(&endpoint, Some(payment.id)));
        db.create_payment(&create).unwrap();
        assert_eq!(db.events_for_payment(payment.id).unwrap().len(), 1);

        db.delete_payment(payment.id).unwrap();
        assert!(db.events_for_payment(payment.id).unwrap().is_empty());
        assert!(db.audit_trail(payment.id).unwrap().is_empty());
    }

    #[test]
    fn test_active_endpoints_filter_by_event() {
        let db = Database::new(":memory:").unwrap();
        let all = sample_endpoint("m1", &["payment_created", "payment_completed"]);
        let only_completed = sample_endpoint("m1", &["payment_completed"]);
        let mut inactive = sample_endpoint("m1", &["payment_created"]);
        inactive.is_active = false;
        let other_merchant = sample_endpoint("m2", &["payment_created"]);
        for e in [&all, &only_completed, &inactive, &other_merchant] {
            db.insert_endpoint(e).unwrap();
        }

        let found = db.active_endpoints_for("m1", "payment_created").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, all.id);
        assert_eq!(found[0].secret, "s3cret");
        assert_eq!(db.list_endpoints("m1").unwrap().len(), 3);
    }

    #[test]
    fn test_event_insert_touches_endpoint() {
        let db = Database::new(":memory:").unwrap();
        let endpoint = sample_endpoint("m1", &["test"]);
        db.insert_endpoint(&endpoint).unwrap();
        let event = sample_event(&endpoint, None);
        db.insert_events(std::slice::from_ref(&event)).unwrap();

        let stored = db.get_endpoint(endpoint.id).unwrap().unwrap();
        assert_eq!(stored.last_triggered_at, Some(event.created_at));
        assert_eq!(db.pending_events().unwrap().len(), 1);
    }

    #[test]
    fn test_failure_threshold_deactivates_endpoint_once() {
        let db = Database::new(":memory:").unwrap();
        let endpoint = sample_endpoint("m1", &["test"]);
        db.insert_endpoint(&endpoint).unwrap();

        let mut last = None;
        for _ in 0..5 {
            let event = sample_event(&endpoint, None);
            db.insert_events(std::slice::from_ref(&event)).unwrap();
            last = db
                .mark_failed(event.id, Some(500), Some("boom"), utc_now(), 5)
                .unwrap();
        }
        assert_eq!(
            last,
            Some(EndpointHealth {
                consecutive_failures: 5,
                deactivated: true
            })
        );
        assert!(!db.get_endpoint(endpoint.id).unwrap().unwrap().is_active);

        let event = sample_event(&endpoint, None);
        db.insert_events(std::slice::from_ref(&event)).unwrap();
        let health = db
            .mark_failed(event.id, None, Some("timeout"), utc_now(), 5)
            .unwrap()
            .unwrap();
        assert!(!health.deactivated);
    }

    #[test]
    fn test_delivery_outcomes_are_exclusive() {
        let db = Database::new(":memory:").unwrap();
        let mut endpoint = sample_endpoint("m1", &["test"]);
        endpoint.consecutive_failures = 3;
        db.insert_endpoint(&endpoint).unwrap();
        let event = sample_event(&endpoint, None);
        db.insert_events(std::slice::from_ref(&event)).unwrap();

        assert!(db.mark_delivered(event.id, 200, "ok", utc_now()).unwrap());
        assert!(!db.mark_delivered(event.id, 200, "ok", utc_now()).unwrap());
        assert!(db
            .mark_failed(event.id, Some(500), None, utc_now(), 5)
            .unwrap()
            .is_none());

        let stored = db.get_event(event.id).unwrap().unwrap();
        assert!(stored.completed_at.is_some());
        assert!(stored.failed_at.is_none());
        assert_eq!(stored.response_code, Some(200));
        assert_eq!(
            db.get_endpoint(endpoint.id).unwrap().unwrap().consecutive_failures,
            0
        );
        assert!(db.pending_events().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_retry_updates_attempt() {
        let db = Database::new(":memory:").unwrap();
        let endpoint = sample_endpoint("m1", &["test"]);
        db.insert_endpoint(&endpoint).unwrap();
        let event = sample_event(&endpoint, None);
        db.insert_events(std::slice::from_ref(&event)).unwrap();

        let retry_at = utc_now() + ChronoDuration::seconds(60);
        db.schedule_retry(event.id, 2, retry_at, Some(503), Some("unavailable"))
            .unwrap();
        let stored = db.get_event(event.id).unwrap().unwrap();
        assert_eq!(stored.attempt, 2);
        assert_eq!(stored.next_retry_at, Some(retry_at));
        assert_eq!(stored.response_body.as_deref(), Some("unavailable"));
    }

    #[test]
    fn test_rate_upsert_replaces_row() {
        let db = Database::new(":memory:").unwrap();
        let mut rate = ExchangeRate {
            crypto_currency: "BTC".into(),
            fiat_currency: "USD".into(),
            rate: dec!(50000),
            source: "coingecko".into(),
            volume_24h: Some(dec!(1000000)),
            market_cap: None,
            change_24h: Some(dec!(-1.5)),
            updated_at: utc_now(),
        };
        db.upsert_rate(&rate).unwrap();
        rate.rate = dec!(51000.25);
        db.upsert_rate(&rate).unwrap();

        assert_eq!(db.latest_rate("BTC", "USD").unwrap(), Some(rate));
        assert!(db.latest_rate("BTC", "EUR").unwrap().is_none());
    }

    #[test]
    fn test_sweep_lock_excludes_other_holders() {
        let db = Database::new(":memory:").unwrap();
        let ttl = Duration::from_secs(120);
        assert!(db.try_acquire("reconcile", "a", ttl).unwrap());
        assert!(!db.try_acquire("reconcile", "b", ttl).unwrap());
        assert!(db.try_acquire("reconcile", "a", ttl).unwrap());
        db.release("reconcile", "a").unwrap();
        assert!(db.try_acquire("reconcile", "b", ttl).unwrap());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let db = Database::new(":memory:").unwrap();
        assert!(db.try_acquire("reconcile", "a", Duration::ZERO).unwrap());
        assert!(db.try_acquire("reconcile", "b", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cryptopay.db");
        let path = path.to_str().unwrap();
        let payment = sample_payment("FILE1");
        {
            let db = Database::new(path).unwrap();
            db.create_payment(&creation(payment.clone())).unwrap();
        }
        let db = Database::new(path).unwrap();
        assert_eq!(db.get_payment(payment.id).unwrap(), Some(payment));
    }
}
