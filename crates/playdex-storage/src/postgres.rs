use std::collections::HashMap;

use async_trait::async_trait;
use playdex_core::{
    AppSearch, AppSearchRow, Application, ApplicationAttributes, CategoryRating, DateField,
    Dimension, DimensionKind, PriceFilter, RatingBucket, YearCount,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{CatalogStore, DbConfig, ReportStore, StorageError, Upsert};

const APP_COLUMNS: &str = "app_id, name, category_id, developer_id, rating, rating_count, \
    installs, min_installs, max_installs, free, price, currency, size, min_os_version, \
    released, last_updated, content_rating, privacy_policy_url, ad_supported, \
    has_in_app_purchases, is_editors_choice, scraped_at";

// 22 binds per application row keeps a chunk well under the 65535 parameter cap.
const APP_CHUNK: usize = 1_000;
const NAME_CHUNK: usize = 5_000;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Postgres-backed store. Every call borrows a pooled connection for its own duration.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(config.connect_options()?)
            .await?;
        info!(db = %config.describe(), "connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("schema migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn violation_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Maps constraint violations raised while writing an application row.
fn application_write_error(err: sqlx::Error, app_id: &str) -> StorageError {
    match violation_code(&err).as_deref() {
        Some(FOREIGN_KEY_VIOLATION) => StorageError::InvalidReference(format!(
            "app {app_id} references an unknown category or developer"
        )),
        _ => StorageError::Database(err),
    }
}

fn dimension_from_row(row: &PgRow) -> Result<Dimension, sqlx::Error> {
    Ok(Dimension {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

fn application_from_row(row: &PgRow) -> Result<Application, sqlx::Error> {
    Ok(Application {
        app_id: row.try_get("app_id")?,
        name: row.try_get("name")?,
        category_id: row.try_get("category_id")?,
        developer_id: row.try_get("developer_id")?,
        attributes: ApplicationAttributes {
            rating: row.try_get("rating")?,
            rating_count: row.try_get("rating_count")?,
            installs: row.try_get("installs")?,
            min_installs: row.try_get("min_installs")?,
            max_installs: row.try_get("max_installs")?,
            free: row.try_get("free")?,
            price: row.try_get("price")?,
            currency: row.try_get("currency")?,
            size: row.try_get("size")?,
            min_os_version: row.try_get("min_os_version")?,
            released: row.try_get("released")?,
            last_updated: row.try_get("last_updated")?,
            content_rating: row.try_get("content_rating")?,
            privacy_policy_url: row.try_get("privacy_policy_url")?,
            ad_supported: row.try_get("ad_supported")?,
            has_in_app_purchases: row.try_get("has_in_app_purchases")?,
            is_editors_choice: row.try_get("is_editors_choice")?,
            scraped_at: row.try_get("scraped_at")?,
        },
    })
}

fn push_application_values<'a>(qb: &mut QueryBuilder<'a, Postgres>, rows: &'a [Application]) {
    qb.push_values(rows, |mut b, app| {
        let a = &app.attributes;
        b.push_bind(&app.app_id)
            .push_bind(&app.name)
            .push_bind(app.category_id)
            .push_bind(app.developer_id)
            .push_bind(a.rating)
            .push_bind(a.rating_count)
            .push_bind(a.installs)
            .push_bind(a.min_installs)
            .push_bind(a.max_installs)
            .push_bind(a.free)
            .push_bind(a.price)
            .push_bind(&a.currency)
            .push_bind(&a.size)
            .push_bind(&a.min_os_version)
            .push_bind(a.released)
            .push_bind(a.last_updated)
            .push_bind(&a.content_rating)
            .push_bind(&a.privacy_policy_url)
            .push_bind(a.ad_supported)
            .push_bind(a.has_in_app_purchases)
            .push_bind(a.is_editors_choice)
            .push_bind(&a.scraped_at);
    });
}

fn dimension_insert_query(kind: DimensionKind, names: &[String]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {} (name) ", kind.table()));
    qb.push_values(names, |mut b, name| {
        b.push_bind(name);
    });
    qb.push(" ON CONFLICT (name) DO NOTHING");
    qb
}

fn application_insert_query(rows: &[Application]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO apps ({APP_COLUMNS}) "));
    push_application_values(&mut qb, rows);
    qb.push(" ON CONFLICT (app_id) DO NOTHING");
    qb
}

fn search_query(filter: &AppSearch) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        r#"
            SELECT a.app_id, a.name AS app_name, c.name AS category_name, a.rating, a.price,
                   a.content_rating, a.last_updated, d.name AS developer_name
              FROM apps a
              JOIN categories c ON a.category_id = c.id
              JOIN developers d ON a.developer_id = d.id
             WHERE a.rating BETWEEN "#,
    );
    qb.push_bind(filter.rating_min)
        .push(" AND ")
        .push_bind(filter.rating_max);
    if !filter.categories.is_empty() {
        qb.push(" AND c.name = ANY(")
            .push_bind(filter.categories.clone())
            .push(")");
    }
    match filter.price {
        PriceFilter::All => {}
        PriceFilter::Free => {
            qb.push(" AND a.price = 0");
        }
        PriceFilter::Paid => {
            qb.push(" AND a.price > 0");
        }
    }
    if let Some(content_rating) = &filter.content_rating {
        qb.push(" AND a.content_rating = ").push_bind(content_rating.clone());
    }
    qb.push(" ORDER BY a.app_id LIMIT ").push_bind(filter.limit.max(0));
    qb
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn insert_dimension_names(
        &self,
        kind: DimensionKind,
        names: &[String],
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in names.chunks(NAME_CHUNK) {
            inserted += dimension_insert_query(kind, chunk)
                .build()
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        debug!(table = kind.table(), offered = names.len(), inserted, "dimension batch committed");
        Ok(inserted)
    }

    async fn dimension_ids(&self, kind: DimensionKind) -> Result<HashMap<String, i32>, StorageError> {
        let rows = sqlx::query(&format!("SELECT id, name FROM {}", kind.table()))
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let dim = dimension_from_row(&row)?;
            out.insert(dim.name, dim.id);
        }
        Ok(out)
    }

    async fn insert_applications(&self, rows: &[Application]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(APP_CHUNK) {
            let first = chunk.first().map(|a| a.app_id.as_str()).unwrap_or_default();
            inserted += application_insert_query(chunk)
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|err| application_write_error(err, first))?
                .rows_affected();
        }
        tx.commit().await?;
        debug!(offered = rows.len(), inserted, "application batch committed");
        Ok(inserted)
    }

    async fn create_dimension(
        &self,
        kind: DimensionKind,
        name: &str,
    ) -> Result<Upsert<Dimension>, StorageError> {
        let created = sqlx::query(&format!(
            "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING RETURNING id, name",
            kind.table()
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = created {
            return Ok(Upsert::Created(dimension_from_row(&row)?));
        }
        let existing = sqlx::query(&format!("SELECT id, name FROM {} WHERE name = $1", kind.table()))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found(kind.label(), name))?;
        Ok(Upsert::Existing(dimension_from_row(&existing)?))
    }

    async fn get_dimension(&self, kind: DimensionKind, id: i32) -> Result<Dimension, StorageError> {
        let row = sqlx::query(&format!("SELECT id, name FROM {} WHERE id = $1", kind.table()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found(kind.label(), id))?;
        Ok(dimension_from_row(&row)?)
    }

    async fn update_dimension(
        &self,
        kind: DimensionKind,
        id: i32,
        name: &str,
    ) -> Result<Dimension, StorageError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET name = $2 WHERE id = $1 RETURNING id, name",
            kind.table()
        ))
        .bind(id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await;
        let row = match result {
            Ok(Some(row)) => row,
            Ok(None) => return Err(StorageError::not_found(kind.label(), id)),
            Err(err) if violation_code(&err).as_deref() == Some(UNIQUE_VIOLATION) => {
                return Err(StorageError::Conflict(format!(
                    "{} name {name:?} is already taken",
                    kind.label()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(dimension_from_row(&row)?)
    }

    async fn delete_dimension(&self, kind: DimensionKind, id: i32) -> Result<(), StorageError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) if done.rows_affected() == 0 => Err(StorageError::not_found(kind.label(), id)),
            Ok(_) => Ok(()),
            Err(err) if violation_code(&err).as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                Err(StorageError::Conflict(format!(
                    "{} {id} is still referenced by applications",
                    kind.label()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_application(&self, app: &Application) -> Result<Upsert<Application>, StorageError> {
        let rows = std::slice::from_ref(app);
        let mut qb = application_insert_query(rows);
        qb.push(format!(" RETURNING {APP_COLUMNS}"));
        let created = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| application_write_error(err, &app.app_id))?;
        match created {
            Some(row) => Ok(Upsert::Created(application_from_row(&row)?)),
            None => Ok(Upsert::Existing(self.get_application(&app.app_id).await?)),
        }
    }

    async fn get_application(&self, app_id: &str) -> Result<Application, StorageError> {
        let row = sqlx::query(&format!("SELECT {APP_COLUMNS} FROM apps WHERE app_id = $1"))
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("app", app_id))?;
        Ok(application_from_row(&row)?)
    }

    async fn update_application(
        &self,
        app_id: &str,
        app: &Application,
    ) -> Result<Application, StorageError> {
        let a = &app.attributes;
        let row = sqlx::query(&format!(
            r#"
            UPDATE apps
               SET (name, category_id, developer_id, rating, rating_count, installs,
                    min_installs, max_installs, free, price, currency, size, min_os_version,
                    released, last_updated, content_rating, privacy_policy_url, ad_supported,
                    has_in_app_purchases, is_editors_choice, scraped_at)
                 = ($2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22)
             WHERE app_id = $1
         RETURNING {APP_COLUMNS}
            "#
        ))
        .bind(app_id)
        .bind(&app.name)
        .bind(app.category_id)
        .bind(app.developer_id)
        .bind(a.rating)
        .bind(a.rating_count)
        .bind(a.installs)
        .bind(a.min_installs)
        .bind(a.max_installs)
        .bind(a.free)
        .bind(a.price)
        .bind(&a.currency)
        .bind(&a.size)
        .bind(&a.min_os_version)
        .bind(a.released)
        .bind(a.last_updated)
        .bind(&a.content_rating)
        .bind(&a.privacy_policy_url)
        .bind(a.ad_supported)
        .bind(a.has_in_app_purchases)
        .bind(a.is_editors_choice)
        .bind(&a.scraped_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| application_write_error(err, app_id))?
        .ok_or_else(|| StorageError::not_found("app", app_id))?;
        Ok(application_from_row(&row)?)
    }

    async fn delete_application(&self, app_id: &str) -> Result<(), StorageError> {
        let done = sqlx::query("DELETE FROM apps WHERE app_id = $1")
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StorageError::not_found("app", app_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ReportStore for PgStore {
    async fn search_applications(&self, filter: &AppSearch) -> Result<Vec<AppSearchRow>, StorageError> {
        let rows = search_query(filter).build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AppSearchRow {
                app_id: row.try_get("app_id")?,
                app_name: row.try_get("app_name")?,
                category_name: row.try_get("category_name")?,
                rating: row.try_get("rating")?,
                price: row.try_get("price")?,
                content_rating: row.try_get("content_rating")?,
                last_updated: row.try_get("last_updated")?,
                developer_name: row.try_get("developer_name")?,
            });
        }
        Ok(out)
    }

    async fn free_applications(&self, categories: &[String]) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT name
              FROM apps
             WHERE category_id IN (SELECT id FROM categories WHERE name = ANY($1))
               AND price = 0
               AND name IS NOT NULL
             ORDER BY name
            "#,
        )
        .bind(categories.to_vec())
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("name")?);
        }
        Ok(out)
    }

    async fn yearly_counts(
        &self,
        categories: &[String],
        field: DateField,
    ) -> Result<Vec<YearCount>, StorageError> {
        let column = field.column();
        let rows = sqlx::query(&format!(
            r#"
            SELECT EXTRACT(YEAR FROM a.{column})::INT AS year, COUNT(*) AS app_count
              FROM apps a
              JOIN categories c ON a.category_id = c.id
             WHERE c.name = ANY($1)
               AND a.{column} IS NOT NULL
             GROUP BY year
             ORDER BY year
            "#
        ))
        .bind(categories.to_vec())
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(YearCount {
                year: row.try_get("year")?,
                app_count: row.try_get("app_count")?,
            });
        }
        Ok(out)
    }

    async fn average_rating_by_category(&self) -> Result<Vec<CategoryRating>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT c.name AS category, AVG(a.rating) AS avg_rating
              FROM apps a
              JOIN categories c ON a.category_id = c.id
             GROUP BY c.name
             ORDER BY avg_rating DESC NULLS LAST, c.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CategoryRating {
                category: row.try_get("category")?,
                avg_rating: row.try_get("avg_rating")?,
            });
        }
        Ok(out)
    }

    async fn rating_distribution(&self) -> Result<Vec<RatingBucket>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT FLOOR(rating)::INT AS bucket, COUNT(*) AS app_count
              FROM apps
             WHERE rating IS NOT NULL
             GROUP BY bucket
             ORDER BY bucket
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RatingBucket {
                bucket: row.try_get("bucket")?,
                app_count: row.try_get("app_count")?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(app_id: &str) -> Application {
        Application {
            app_id: app_id.to_string(),
            name: Some(format!("{app_id} name")),
            category_id: 1,
            developer_id: 1,
            attributes: ApplicationAttributes::default(),
        }
    }

    #[test]
    fn dimension_insert_skips_existing_names() {
        let names = vec!["Tools".to_string(), "Games".to_string()];
        let qb = dimension_insert_query(DimensionKind::Developer, &names);
        assert_eq!(
            qb.sql(),
            "INSERT INTO developers (name) VALUES ($1), ($2) ON CONFLICT (name) DO NOTHING"
        );
    }

    #[test]
    fn application_insert_binds_every_column_and_skips_existing_keys() {
        let rows = vec![app("com.a.b"), app("com.c.d")];
        let qb = application_insert_query(&rows);
        let sql = qb.sql();
        assert!(sql.starts_with(&format!("INSERT INTO apps ({APP_COLUMNS}) VALUES ($1, ")));
        assert!(sql.ends_with("$44) ON CONFLICT (app_id) DO NOTHING"));
        assert!(!sql.contains("$45"));
        assert_eq!(APP_COLUMNS.split(',').count(), 22);
    }

    #[test]
    fn full_application_chunk_stays_under_the_bind_limit() {
        let rows: Vec<Application> = (0..APP_CHUNK + 1).map(|i| app(&format!("app.{i}"))).collect();
        let chunks: Vec<&[Application]> = rows.chunks(APP_CHUNK).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 1);

        let binds = APP_CHUNK * 22;
        assert!(binds < u16::MAX as usize);
        let qb = application_insert_query(chunks[0]);
        assert!(qb.sql().contains(&format!("${binds})")));
        assert!(!qb.sql().contains(&format!("${}", binds + 1)));

        let names: Vec<String> = (0..NAME_CHUNK).map(|i| format!("dev {i}")).collect();
        let qb = dimension_insert_query(DimensionKind::Developer, &names);
        assert!(qb.sql().contains(&format!("(${NAME_CHUNK}) ON CONFLICT")));
    }

    #[test]
    fn default_search_filters_only_by_rating_range() {
        let qb = search_query(&AppSearch::default());
        let sql = qb.sql();
        assert!(sql.contains("WHERE a.rating BETWEEN $1 AND $2"));
        assert!(sql.ends_with(" ORDER BY a.app_id LIMIT $3"));
        assert!(!sql.contains("ANY("));
        assert!(!sql.contains("a.price"));
        assert!(!sql.contains("a.content_rating ="));
    }

    #[test]
    fn search_adds_each_requested_filter_in_order() {
        let filter = AppSearch {
            categories: vec!["Tools".to_string(), "Games".to_string()],
            price: PriceFilter::Paid,
            content_rating: Some("Teen".to_string()),
            ..AppSearch::default()
        };
        let qb = search_query(&filter);
        assert!(qb.sql().ends_with(
            "BETWEEN $1 AND $2 AND c.name = ANY($3) AND a.price > 0 \
             AND a.content_rating = $4 ORDER BY a.app_id LIMIT $5"
        ));

        let free = AppSearch {
            price: PriceFilter::Free,
            ..AppSearch::default()
        };
        assert!(search_query(&free)
            .sql()
            .ends_with("BETWEEN $1 AND $2 AND a.price = 0 ORDER BY a.app_id LIMIT $3"));
    }

    #[test]
    fn non_database_errors_have_no_violation_code() {
        assert_eq!(violation_code(&sqlx::Error::RowNotFound), None);
        assert!(matches!(
            application_write_error(sqlx::Error::RowNotFound, "com.a.b"),
            StorageError::Database(_)
        ));
    }
}
