use super::models::*;
use super::PaymentStore;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{info, warn};

const PAYMENT_COLUMNS: &str = "p.id, p.tenant_id, p.reseller_id, p.reseller_type, p.package_id, \
     p.credits, p.amount, p.external_id, p.qr_code, p.status, p.expires_at, p.paid_at, \
     p.processing, p.processing_started_at, p.created_at";

/// SELECT resolving every reseller of one panel kind to its panel context.
/// Table and column names come from the closed `PanelKind` enum.
pub(crate) fn panel_select(kind: PanelKind) -> String {
    let tables = kind.tables();
    format!(
        "SELECT '{kind}'::text AS res_kind, r.id AS res_reseller_id, r.tenant_id AS res_tenant_id, \
         r.username AS res_username, r.{account} AS res_account_id, pn.url AS res_panel_url, \
         pn.admin_username AS res_admin_username, pn.admin_password AS res_admin_password, \
         pn.has_captcha AS res_has_captcha, pn.captcha_site_key AS res_captcha_site_key \
         FROM {resellers} r JOIN {panels} pn ON pn.id = r.panel_id AND pn.tenant_id = r.tenant_id",
        kind = kind.as_str(),
        account = tables.account_column,
        resellers = tables.resellers,
        panels = tables.panels,
    )
}

/// All panel kinds stacked into one polymorphic relation
pub(crate) fn resolution_union() -> String {
    PanelKind::all()
        .into_iter()
        .map(panel_select)
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

fn joined_payments_sql(filter: &str) -> String {
    format!(
        "SELECT {columns}, res.* \
         FROM payments p \
         JOIN tenants t ON t.id = p.tenant_id \
         LEFT JOIN ({union}) res \
           ON res.res_kind = lower(p.reseller_type) \
          AND res.res_reseller_id = p.reseller_id \
          AND res.res_tenant_id = p.tenant_id \
         {filter}",
        columns = PAYMENT_COLUMNS,
        union = resolution_union(),
        filter = filter,
    )
}

/// Ledger repository - THE source of truth for payments and their audit trail
pub struct PgPaymentStore {
    pub pool: PgPool,
    pending_sql: String,
    by_id_sql: String,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            pending_sql: joined_payments_sql(
                "WHERE p.status = 'pending' \
                   AND (p.expires_at IS NULL OR p.expires_at > NOW()) \
                   AND t.status = 'active' \
                   AND (t.expires_at IS NULL OR t.expires_at > NOW()) \
                 ORDER BY p.created_at",
            ),
            by_id_sql: joined_payments_sql("WHERE p.id = $1"),
        }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    fn payment_from_row(row: &PgRow) -> AppResult<Payment> {
        let status: String = row.try_get("status")?;
        let status = status.parse::<PaymentStatus>().map_err(AppError::Internal)?;

        Ok(Payment {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            reseller_id: row.try_get("reseller_id")?,
            reseller_type: row.try_get("reseller_type")?,
            package_id: row.try_get("package_id")?,
            credits: row.try_get("credits")?,
            amount: row.try_get("amount")?,
            external_id: row.try_get("external_id")?,
            qr_code: row.try_get("qr_code")?,
            status,
            expires_at: row.try_get("expires_at")?,
            paid_at: row.try_get("paid_at")?,
            processing: row.try_get("processing")?,
            processing_started_at: row.try_get("processing_started_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn panel_from_row(row: &PgRow) -> AppResult<Option<PanelContext>> {
        let kind: Option<String> = row.try_get("res_kind")?;
        let Some(kind) = kind else {
            return Ok(None);
        };
        let kind = kind.parse::<PanelKind>()?;

        Ok(Some(PanelContext {
            kind,
            reseller_id: row.try_get("res_reseller_id")?,
            tenant_id: row.try_get("res_tenant_id")?,
            username: row.try_get("res_username")?,
            account_id: row.try_get("res_account_id")?,
            panel_url: row.try_get("res_panel_url")?,
            admin_username: row.try_get("res_admin_username")?,
            admin_password: row.try_get("res_admin_password")?,
            has_captcha: row.try_get("res_has_captcha")?,
            captcha_site_key: row.try_get("res_captcha_site_key")?,
        }))
    }

    fn join_row(row: &PgRow) -> AppResult<PaymentJoinRow> {
        Ok(PaymentJoinRow {
            payment: Self::payment_from_row(row)?,
            panel: Self::panel_from_row(row)?,
        })
    }

    fn status_list(statuses: &[PaymentStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }

    async fn insert_transaction_in(
        tx: &mut Transaction<'_, Postgres>,
        transaction: &NewTransaction,
    ) -> AppResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO transactions (payment_id, reseller_id, reseller_type, credits, amount, response, success)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(transaction.payment_id)
        .bind(transaction.reseller_id)
        .bind(&transaction.reseller_type)
        .bind(transaction.credits)
        .bind(transaction.amount)
        .bind(&transaction.response)
        .bind(transaction.success)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    async fn update_status_in(
        tx: &mut Transaction<'_, Postgres>,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> AppResult<bool> {
        PaymentStatus::check_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, paid_at = COALESCE($4, paid_at), updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(payment_id)
        .bind(Self::status_list(from))
        .bind(to.as_str())
        .bind(paid_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn pending_payments(&self) -> AppResult<Vec<PaymentJoinRow>> {
        let rows = sqlx::query(&self.pending_sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::join_row).collect()
    }

    async fn get_payment(&self, payment_id: i64) -> AppResult<Option<PaymentJoinRow>> {
        let row = sqlx::query(&self.by_id_sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::join_row).transpose()
    }

    async fn set_payment_status(
        &self,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;
        let updated = Self::update_status_in(&mut tx, payment_id, from, to, paid_at).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn insert_transaction(&self, transaction: NewTransaction) -> AppResult<i64> {
        let mut tx = self.begin_tx().await?;
        let id = Self::insert_transaction_in(&mut tx, &transaction).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn record_outcome(
        &self,
        payment_id: i64,
        from: &[PaymentStatus],
        to: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
        transaction: NewTransaction,
    ) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let updated = Self::update_status_in(&mut tx, payment_id, from, to, paid_at).await?;
        if !updated {
            warn!(
                "Payment {} was not in {:?}; recording attempt without status change to {}",
                payment_id, from, to
            );
        }
        Self::insert_transaction_in(&mut tx, &transaction).await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn acquire_lock(
        &self,
        payment_id: i64,
        ceiling: Duration,
        token: &str,
    ) -> AppResult<LockAcquisition> {
        // FOR UPDATE serializes concurrent acquirers on the row; the loser re-reads
        // processing = TRUE and matches nothing.
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT id, processing, processing_started_at
                FROM payments
                WHERE id = $1
                FOR UPDATE
            )
            UPDATE payments p
            SET processing = TRUE, processing_started_at = NOW(), processing_token = $3
            FROM prev
            WHERE p.id = prev.id
              AND (
                    prev.processing = FALSE
                 OR prev.processing_started_at IS NULL
                 OR prev.processing_started_at < NOW() - make_interval(secs => $2)
              )
            RETURNING prev.processing AS was_held
            "#,
        )
        .bind(payment_id)
        .bind(ceiling.as_secs_f64())
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(LockAcquisition::Busy),
            Some(row) => {
                let was_held: bool = row.try_get("was_held")?;
                if was_held {
                    Ok(LockAcquisition::Stolen)
                } else {
                    Ok(LockAcquisition::Acquired)
                }
            }
        }
    }

    async fn renew_lock(&self, payment_id: i64, token: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET processing_started_at = NOW()
            WHERE id = $1 AND processing = TRUE AND processing_token = $2
            "#,
        )
        .bind(payment_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, payment_id: i64, token: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET processing = FALSE, processing_started_at = NULL, processing_token = NULL
            WHERE id = $1 AND processing_token = $2
            "#,
        )
        .bind(payment_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn tenant_config(&self, tenant_id: i64, key: &str) -> AppResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"SELECT value FROM tenant_config WHERE tenant_id = $1 AND key = $2"#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn tenant(&self, tenant_id: i64) -> AppResult<Option<Tenant>> {
        let row = sqlx::query(r#"SELECT id, name, status, expires_at FROM tenants WHERE id = $1"#)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;

        Ok(Some(Tenant {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: status.parse().map_err(AppError::Internal)?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    async fn resolve_panel(
        &self,
        reference: ResellerRef,
        tenant_id: i64,
    ) -> AppResult<Option<PanelContext>> {
        let sql = format!(
            "{} WHERE r.id = $1 AND r.tenant_id = $2",
            panel_select(reference.kind)
        );
        let row = sqlx::query(&sql)
            .bind(reference.id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::panel_from_row(&row),
            None => Ok(None),
        }
    }

    async fn error_payments(
        &self,
        tenant_id: i64,
        reseller: Option<ResellerRef>,
    ) -> AppResult<Vec<i64>> {
        let ids = match reseller {
            Some(reseller) => {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    SELECT id FROM payments
                    WHERE tenant_id = $1 AND status = 'error'
                      AND lower(reseller_type) = $2 AND reseller_id = $3
                    ORDER BY created_at
                    "#,
                )
                .bind(tenant_id)
                .bind(reseller.kind.as_str())
                .bind(reseller.id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    SELECT id FROM payments
                    WHERE tenant_id = $1 AND status = 'error'
                    ORDER BY created_at
                    "#,
                )
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(ids)
    }

    async fn transactions_for_payment(&self, payment_id: i64) -> AppResult<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payment_id, reseller_id, reseller_type, credits, amount, response, success, created_at
            FROM transactions
            WHERE payment_id = $1
            ORDER BY id
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> AppResult<TransactionRecord> {
                Ok(TransactionRecord {
                    id: r.try_get("id")?,
                    payment_id: r.try_get("payment_id")?,
                    reseller_id: r.try_get("reseller_id")?,
                    reseller_type: r.try_get("reseller_type")?,
                    credits: r.try_get("credits")?,
                    amount: r.try_get("amount")?,
                    response: r.try_get("response")?,
                    success: r.try_get("success")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn package(&self, tenant_id: i64, package_id: i64) -> AppResult<Option<CreditPackage>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, panel_type, name, credits, price, active
            FROM credit_packages
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(package_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> AppResult<CreditPackage> {
            Ok(CreditPackage {
                id: r.try_get("id")?,
                tenant_id: r.try_get("tenant_id")?,
                panel_type: r.try_get("panel_type")?,
                name: r.try_get("name")?,
                credits: r.try_get("credits")?,
                price: r.try_get("price")?,
                active: r.try_get("active")?,
            })
        })
        .transpose()
    }

    async fn create_payment(&self, payment: NewPayment) -> AppResult<Payment> {
        let row = sqlx::query(
            r#"
            INSERT INTO payments (
                tenant_id, reseller_id, reseller_type, package_id, credits, amount,
                external_id, qr_code, status, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9)
            RETURNING id, tenant_id, reseller_id, reseller_type, package_id, credits, amount,
                      external_id, qr_code, status, expires_at, paid_at, processing,
                      processing_started_at, created_at
            "#,
        )
        .bind(payment.tenant_id)
        .bind(payment.reseller_id)
        .bind(&payment.reseller_type)
        .bind(payment.package_id)
        .bind(payment.credits)
        .bind(payment.amount)
        .bind(&payment.external_id)
        .bind(&payment.qr_code)
        .bind(payment.expires_at)
        .fetch_one(&self.pool)
        .await?;

        let created = Self::payment_from_row(&row)?;
        info!(
            "Payment {} created for {} reseller {} ({} credits)",
            created.id, created.reseller_type, created.reseller_id, created.credits
        );
        Ok(created)
    }

    async fn audit_discrepancies(&self) -> AppResult<Vec<Discrepancy>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.tenant_id, p.status,
                   COUNT(t.id) FILTER (WHERE t.success) AS successful_attempts
            FROM payments p
            LEFT JOIN transactions t ON t.payment_id = p.id
            GROUP BY p.id, p.tenant_id, p.status
            HAVING (p.status = 'paid' AND COUNT(t.id) FILTER (WHERE t.success) = 0)
                OR (p.status <> 'paid' AND COUNT(t.id) FILTER (WHERE t.success) > 0)
            ORDER BY p.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> AppResult<Discrepancy> {
                let status: String = r.try_get("status")?;
                let status = status.parse::<PaymentStatus>().map_err(AppError::Internal)?;
                let kind = if status == PaymentStatus::Paid {
                    DiscrepancyKind::PaidWithoutAudit
                } else {
                    DiscrepancyKind::CreditedNotPaid
                };

                Ok(Discrepancy {
                    payment_id: r.try_get("id")?,
                    tenant_id: r.try_get("tenant_id")?,
                    status,
                    successful_attempts: r.try_get("successful_attempts")?,
                    kind,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_select_only_touches_its_own_tables() {
        for kind in PanelKind::all() {
            let sql = panel_select(kind);
            let own = kind.tables();
            assert!(sql.contains(&format!("'{}'::text", kind.as_str())));
            assert!(sql.contains(&format!("FROM {} r", own.resellers)));
            assert!(sql.contains(&format!("JOIN {} pn", own.panels)));
            assert!(sql.contains(&format!("r.{} AS res_account_id", own.account_column)));

            for other in PanelKind::all().into_iter().filter(|k| *k != kind) {
                let theirs = other.tables();
                assert!(!sql.contains(theirs.resellers), "{} leaks {}", kind, other);
                assert!(!sql.contains(theirs.panels), "{} leaks {}", kind, other);
            }
        }
    }

    #[test]
    fn test_union_covers_every_kind() {
        let union = resolution_union();
        assert_eq!(union.matches("UNION ALL").count(), PanelKind::all().len() - 1);
        for kind in PanelKind::all() {
            assert!(union.contains(kind.tables().resellers));
        }
    }

    #[test]
    fn test_pending_join_is_tenant_scoped() {
        let sql = joined_payments_sql("");
        assert!(sql.contains("res.res_tenant_id = p.tenant_id"));
        assert!(sql.contains("LEFT JOIN"));
    }
}
