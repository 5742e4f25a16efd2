use async_trait::async_trait;
use cardrelay_core::{
    AmendOutcome, Completeness, Confidence, Fingerprint, ForwardStore, ForwardedRecord, MessageId,
    ProviderTag, StoreError, StoreStats, UnitKind, UnitValue,
};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, Database, DatabaseConnection,
    DbErr, EntityTrait, PaginatorTrait, QueryFilter, Schema, Set, SqlErr,
};
use tracing::{debug, info};

use crate::entity::forwarded_records::{self, Column, Entity};

fn is_table_already_exists_error(err: &DbErr) -> bool {
    err.to_string().contains("table") && err.to_string().contains("already exists")
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        || err.to_string().contains("UNIQUE constraint failed")
}

fn transient(err: DbErr) -> StoreError {
    StoreError::Transient(err.into())
}

/// [`ForwardStore`] backed by a `SeaORM` connection (`SQLite` by default).
///
/// Atomicity per fingerprint comes from the database: `create` relies on the
/// primary key, `amend` is a single conditional `UPDATE`.
pub struct SqlStore {
    db: DatabaseConnection,
}

impl SqlStore {
    /// Connect and create the `forwarded_records` table if needed.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database: {}", database_url);
        let db = Database::connect(database_url).await?;

        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        let stmt = schema.create_table_from_entity(Entity);
        match db
            .execute_unprepared(&backend.build(&stmt).to_string())
            .await
        {
            Ok(_) => {}
            Err(e) if is_table_already_exists_error(&e) => {
                info!("Table already exists, skipping creation");
            }
            Err(e) => return Err(e.into()),
        }

        info!("SqlStore initialized");
        Ok(Self { db })
    }

    async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<ForwardedRecord>, StoreError> {
        Entity::find_by_id(fingerprint.as_str().to_owned())
            .one(&self.db)
            .await
            .map_err(transient)?
            .map(into_record)
            .transpose()
    }

    async fn count(&self, filter: Condition) -> Result<u64, StoreError> {
        Entity::find()
            .filter(filter)
            .count(&self.db)
            .await
            .map_err(transient)
    }
}

fn into_record(model: forwarded_records::Model) -> Result<ForwardedRecord, StoreError> {
    let fingerprint = Fingerprint::from_stored(model.fingerprint);
    let corrupt = |what: String| StoreError::Corrupt(fingerprint.clone(), what);

    let unit = match (model.unit_amount, model.unit_kind, model.unit_confidence) {
        (None, None, None) => None,
        (Some(amount), Some(kind), Some(confidence)) => Some(UnitValue {
            amount: u32::try_from(amount).map_err(|e| corrupt(e.to_string()))?,
            kind: kind.parse::<UnitKind>().map_err(|e| corrupt(e.to_string()))?,
            confidence: confidence
                .parse::<Confidence>()
                .map_err(|e| corrupt(e.to_string()))?,
        }),
        _ => return Err(corrupt("partially stored unit value".to_string())),
    };
    let completeness = model
        .completeness
        .parse::<Completeness>()
        .map_err(|e| corrupt(e.to_string()))?;

    Ok(ForwardedRecord {
        card_number: model.card_number,
        provider: ProviderTag::new(&model.provider),
        unit,
        completeness,
        forwarded_message_id: model.forwarded_message_id,
        source_channel: model.source_channel,
        card_date: model.card_date,
        created_at: model.created_at.and_utc(),
        last_amended_at: model.last_amended_at.map(|at| at.and_utc()),
        fingerprint,
    })
}

/// Confidences a new value of `confidence` strictly beats.
fn weaker_than(confidence: Confidence) -> Vec<&'static str> {
    [Confidence::None, Confidence::Low, Confidence::High]
        .into_iter()
        .filter(|c| *c < confidence)
        .map(|c| c.as_str())
        .collect()
}

#[async_trait]
impl ForwardStore for SqlStore {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ForwardedRecord>, StoreError> {
        self.fetch(fingerprint).await
    }

    async fn create(&self, record: &ForwardedRecord) -> Result<(), StoreError> {
        let model = forwarded_records::ActiveModel {
            fingerprint: Set(record.fingerprint.as_str().to_owned()),
            card_number: Set(record.card_number.clone()),
            provider: Set(record.provider.as_str().to_owned()),
            unit_amount: Set(record.unit.map(|u| i64::from(u.amount))),
            unit_kind: Set(record.unit.map(|u| u.kind.as_str().to_owned())),
            unit_confidence: Set(record.unit.map(|u| u.confidence.as_str().to_owned())),
            completeness: Set(record.completeness.as_str().to_owned()),
            forwarded_message_id: Set(record.forwarded_message_id),
            source_channel: Set(record.source_channel),
            card_date: Set(record.card_date),
            created_at: Set(record.created_at.naive_utc()),
            last_amended_at: Set(record.last_amended_at.map(|at| at.naive_utc())),
        };

        match model.insert(&self.db).await {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                debug!("Create conflict on {}", record.fingerprint.short());
                Err(StoreError::Conflict(record.fingerprint.clone()))
            }
            Err(e) => Err(transient(e)),
        }
    }

    async fn amend(
        &self,
        fingerprint: &Fingerprint,
        unit: UnitValue,
        completeness: Completeness,
        at: DateTime<Utc>,
    ) -> Result<AmendOutcome, StoreError> {
        let mut update = Entity::update_many()
            .col_expr(Column::UnitAmount, Expr::value(i64::from(unit.amount)))
            .col_expr(Column::UnitKind, Expr::value(unit.kind.as_str()))
            .col_expr(Column::UnitConfidence, Expr::value(unit.confidence.as_str()))
            .col_expr(Column::LastAmendedAt, Expr::value(at.naive_utc()))
            .filter(Column::Fingerprint.eq(fingerprint.as_str()))
            .filter(
                Condition::any()
                    .add(Column::UnitAmount.is_null())
                    .add(Column::UnitConfidence.is_in(weaker_than(unit.confidence))),
            );
        if completeness == Completeness::Complete {
            update = update.col_expr(Column::Completeness, Expr::value(completeness.as_str()));
        }

        let result = update.exec(&self.db).await.map_err(transient)?;
        let record = self
            .fetch(fingerprint)
            .await?
            .ok_or_else(|| StoreError::NotFound(fingerprint.clone()))?;

        if result.rows_affected == 0 {
            Ok(AmendOutcome::Stale(record))
        } else {
            Ok(AmendOutcome::Applied(record))
        }
    }

    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        forwarded_message_id: MessageId,
    ) -> Result<(), StoreError> {
        let result = Entity::update_many()
            .col_expr(Column::ForwardedMessageId, Expr::value(forwarded_message_id))
            .filter(Column::Fingerprint.eq(fingerprint.as_str()))
            .exec(&self.db)
            .await
            .map_err(transient)?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(fingerprint.clone()));
        }
        Ok(())
    }

    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        Entity::delete_many()
            .filter(Column::Fingerprint.eq(fingerprint.as_str()))
            .filter(Column::ForwardedMessageId.is_null())
            .exec(&self.db)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            total: self.count(Condition::all()).await?,
            complete: self
                .count(Condition::all().add(Column::Completeness.eq(Completeness::Complete.as_str())))
                .await?,
            partial: self
                .count(Condition::all().add(Column::Completeness.eq(Completeness::Partial.as_str())))
                .await?,
            provisional: self
                .count(Condition::all().add(Column::ForwardedMessageId.is_null()))
                .await?,
        })
    }
}
