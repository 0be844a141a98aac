use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    AddressId, CheckoutSessionId, CompensationId, OrderId, ProductId, ReservationId,
    StockUnitKey, UserId,
};
use domain::{
    CompensationAction, CreationLock, CreationToken, LockAcquisition, Money, Order, OrderItem,
    OrderStatus, PaymentStatus, PendingCompensation, Reservation, ReservationStatus,
    ShipmentLinkage,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{
        CompensationQueue, OrderStore, ReservationStore, ReserveUnitOutcome, ShipmentLockStore,
    },
};

const ACTIVE_RESERVATION_CONSTRAINT: &str = "unique_active_reservation";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation> {
        let status: String = row.try_get("status")?;
        Ok(Reservation {
            id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            key: Self::row_to_key(&row)?,
            checkout_session_id: CheckoutSessionId::from_uuid(
                row.try_get::<Uuid, _>("checkout_session_id")?,
            ),
            quantity: to_u32("quantity", row.try_get("quantity")?)?,
            expires_at: row.try_get("expires_at")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_key(row: &PgRow) -> Result<StockUnitKey> {
        Ok(StockUnitKey::new(
            ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            row.try_get("color_id")?,
            row.try_get("size_id")?,
        ))
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        let payment_method: String = row.try_get("payment_method")?;
        let payment_status: String = row.try_get("payment_status")?;
        let shipment_order_id: Option<String> = row.try_get("shipment_order_id")?;
        let shipment_id: Option<String> = row.try_get("shipment_id")?;

        let shipment = match (shipment_order_id, shipment_id) {
            (Some(shipment_order_id), Some(shipment_id)) => Some(ShipmentLinkage {
                shipment_order_id,
                shipment_id,
                awb_code: row.try_get("shipment_awb_code")?,
            }),
            _ => None,
        };

        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            checkout_session_id: CheckoutSessionId::from_uuid(
                row.try_get::<Uuid, _>("checkout_session_id")?,
            ),
            total_amount: Money::from_cents(row.try_get("total_amount_cents")?),
            status: status.parse()?,
            payment_method: payment_method.parse()?,
            payment_status: payment_status.parse()?,
            shipping_address_id: row
                .try_get::<Option<Uuid>, _>("shipping_address_id")?
                .map(AddressId::from_uuid),
            shipment,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_item(row: PgRow) -> Result<OrderItem> {
        Ok(OrderItem {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            key: Self::row_to_key(&row)?,
            product_name: row.try_get("product_name")?,
            quantity: to_u32("quantity", row.try_get("quantity")?)?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
        })
    }

    fn row_to_lock(row: PgRow) -> Result<CreationLock> {
        let status: String = row.try_get("status")?;
        Ok(CreationLock {
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            creation_token: CreationToken::from_uuid(row.try_get("creation_token")?),
            status: status.parse()?,
            lock_acquired_at: row.try_get("lock_acquired_at")?,
            lock_ttl: Duration::seconds(row.try_get("lock_ttl_seconds")?),
        })
    }

    fn row_to_compensation(row: PgRow) -> Result<PendingCompensation> {
        let action_json: serde_json::Value = row.try_get("action")?;
        let action: CompensationAction = serde_json::from_value(action_json)?;
        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(PendingCompensation {
            id: CompensationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            action,
            reason: row.try_get("reason")?,
            attempts: to_u32("attempts", i64::from(attempts))?,
            last_error: row.try_get("last_error")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn to_u32(column: &'static str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

fn unique_violation(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return StoreError::UniqueViolation {
            constraint: db_err.constraint().unwrap_or("unknown").to_string(),
        };
    }
    StoreError::Database(e)
}

#[async_trait]
impl ReservationStore for PostgresStore {
    async fn reserve_unit(
        &self,
        reservation: &Reservation,
        on_hand: u32,
        now: DateTime<Utc>,
    ) -> Result<ReserveUnitOutcome> {
        let key = &reservation.key;
        let mut tx = self.pool.begin().await?;

        // Serializes capacity checks for one stock unit until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;

        let held: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM stock_reservations
            WHERE product_id = $1 AND color_id = $2 AND size_id = $3
                AND status = 'active' AND expires_at > $4
            "#,
        )
        .bind(key.product_id.as_uuid())
        .bind(key.color_id)
        .bind(key.size_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        if held + i64::from(reservation.quantity) > i64::from(on_hand) {
            tx.rollback().await?;
            let available = (i64::from(on_hand) - held).max(0);
            return Ok(ReserveUnitOutcome::Insufficient {
                available: to_u32("quantity", available)?,
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO stock_reservations
                (id, product_id, color_id, size_id, checkout_session_id, quantity, status, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(key.color_id)
        .bind(key.size_id)
        .bind(reservation.checkout_session_id.as_uuid())
        .bind(i64::from(reservation.quantity))
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(reservation.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(ReserveUnitOutcome::Inserted)
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some(ACTIVE_RESERVATION_CONSTRAINT) =>
            {
                tx.rollback().await?;
                Ok(ReserveUnitOutcome::AlreadyReserved)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reserved_quantity(&self, key: &StockUnitKey, now: DateTime<Utc>) -> Result<u32> {
        let held: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM stock_reservations
            WHERE product_id = $1 AND color_id = $2 AND size_id = $3
                AND status = 'active' AND expires_at > $4
            "#,
        )
        .bind(key.product_id.as_uuid())
        .bind(key.color_id)
        .bind(key.size_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        to_u32("quantity", held)
    }

    async fn transition_reservations(
        &self,
        ids: &[ReservationId],
        to: ReservationStatus,
    ) -> Result<u64> {
        if ids.is_empty() || !ReservationStatus::Active.can_transition_to(to) {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();

        let result = sqlx::query(
            r#"
            UPDATE stock_reservations
            SET status = $1, updated_at = NOW()
            WHERE id = ANY($2) AND status = 'active'
            "#,
        )
        .bind(to.as_str())
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn transition_session(
        &self,
        session_id: CheckoutSessionId,
        to: ReservationStatus,
    ) -> Result<u64> {
        if !ReservationStatus::Active.can_transition_to(to) {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE stock_reservations
            SET status = $1, updated_at = NOW()
            WHERE checkout_session_id = $2 AND status = 'active'
            "#,
        )
        .bind(to.as_str())
        .bind(session_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stock_reservations
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'active' AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reservations_for_session(
        &self,
        session_id: CheckoutSessionId,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, color_id, size_id, checkout_session_id, quantity, status, expires_at, created_at
            FROM stock_reservations
            WHERE checkout_session_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, user_id, checkout_session_id, total_amount_cents, status, payment_method,
                 payment_status, shipping_address_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(order.checkout_session_id.as_uuid())
        .bind(order.total_amount.cents())
        .bind(order.status.as_str())
        .bind(order.payment_method.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.shipping_address_id.map(|a| a.as_uuid()))
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(unique_violation)?;

        Ok(())
    }

    async fn insert_order_items(&self, items: &[OrderItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO order_items
                    (order_id, product_id, color_id, size_id, product_name, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(item.order_id.as_uuid())
            .bind(item.key.product_id.as_uuid())
            .bind(item.key.color_id)
            .bind(item.key.size_id)
            .bind(&item.product_name)
            .bind(i64::from(item.quantity))
            .bind(item.unit_price.cents())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_order(&self, order_id: OrderId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(order_id.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, checkout_session_id, total_amount_cents, status, payment_method,
                   payment_status, shipping_address_id, shipment_order_id, shipment_id,
                   shipment_awb_code, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }

    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, color_id, size_id, product_name, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_item).collect()
    }

    async fn update_order_status(&self, order_id: OrderId, status: OrderStatus) -> Result<bool> {
        let result =
            sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.as_str())
                .bind(order_id.as_uuid())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_payment_status(
        &self,
        order_id: OrderId,
        status: PaymentStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE orders SET payment_status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.as_str())
                .bind(order_id.as_uuid())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ShipmentLockStore for PostgresStore {
    async fn acquire_creation_lock(
        &self,
        order_id: OrderId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition> {
        let row = sqlx::query(
            r#"
            SELECT outcome, lock_token, linked_order_id, linked_shipment_id, linked_awb_code
            FROM acquire_shipment_creation_lock($1, $2, $3, $4)
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(CreationToken::new().as_uuid())
        .bind(ttl.num_seconds())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let outcome: String = row.try_get("outcome")?;
        match outcome.as_str() {
            "acquired" => Ok(LockAcquisition::Acquired(CreationToken::from_uuid(
                row.try_get("lock_token")?,
            ))),
            "already_exists" => Ok(LockAcquisition::AlreadyExists(ShipmentLinkage {
                shipment_order_id: row.try_get("linked_order_id")?,
                shipment_id: row
                    .try_get::<Option<String>, _>("linked_shipment_id")?
                    .unwrap_or_default(),
                awb_code: row.try_get("linked_awb_code")?,
            })),
            "in_progress" => Ok(LockAcquisition::InProgress),
            "order_missing" => Ok(LockAcquisition::OrderMissing),
            other => Err(StoreError::Corrupt(domain::DomainError::UnknownStatus {
                kind: "lock outcome",
                value: other.to_string(),
            })),
        }
    }

    async fn finalize_creation(
        &self,
        order_id: OrderId,
        token: CreationToken,
        linkage: &ShipmentLinkage,
    ) -> Result<bool> {
        let finalized: bool =
            sqlx::query_scalar("SELECT finalize_shipment_creation($1, $2, $3, $4, $5)")
                .bind(order_id.as_uuid())
                .bind(token.as_uuid())
                .bind(&linkage.shipment_order_id)
                .bind(&linkage.shipment_id)
                .bind(linkage.awb_code.as_deref())
                .fetch_one(&self.pool)
                .await?;

        Ok(finalized)
    }

    async fn mark_creation_failed(&self, order_id: OrderId, token: CreationToken) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE shipment_creation_locks
            SET status = 'failed'
            WHERE order_id = $1 AND creation_token = $2 AND status = 'locked'
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(token.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_creation_lock(&self, order_id: OrderId) -> Result<Option<CreationLock>> {
        let row = sqlx::query(
            r#"
            SELECT order_id, creation_token, status, lock_acquired_at, lock_ttl_seconds
            FROM shipment_creation_locks
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_lock).transpose()
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE shipment_creation_locks
            SET status = 'failed'
            WHERE status = 'locked'
                AND lock_acquired_at + make_interval(secs => lock_ttl_seconds) <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CompensationQueue for PostgresStore {
    async fn enqueue_compensation(&self, record: &PendingCompensation) -> Result<()> {
        let action = serde_json::to_value(&record.action)?;
        let attempts = i32::try_from(record.attempts).unwrap_or(i32::MAX);

        sqlx::query(
            r#"
            INSERT INTO pending_compensations
                (id, order_id, action, reason, attempts, last_error, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.order_id.as_uuid())
        .bind(action)
        .bind(&record.reason)
        .bind(attempts)
        .bind(record.last_error.as_deref())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(unique_violation)?;

        Ok(())
    }

    async fn pending_compensations(&self, limit: usize) -> Result<Vec<PendingCompensation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, action, reason, attempts, last_error, status, created_at
            FROM pending_compensations
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_compensation).collect()
    }

    async fn resolve_compensation(&self, id: CompensationId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_compensations
            SET status = 'resolved', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_compensation_attempt(&self, id: CompensationId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_compensations
            SET attempts = attempts + 1, last_error = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
