use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Datelike;
use playdex_core::{
    AppSearch, AppSearchRow, Application, CategoryRating, DateField, Dimension, DimensionKind,
    PriceFilter, RatingBucket, YearCount,
};
use tokio::sync::Mutex;

use crate::{CatalogStore, ReportStore, StorageError, Upsert};

/// Full contents of a `MemoryStore`, comparable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub categories: BTreeMap<i32, String>,
    pub developers: BTreeMap<i32, String>,
    pub apps: BTreeMap<String, Application>,
    next_category_id: i32,
    next_developer_id: i32,
}

impl MemoryState {
    fn table(&self, kind: DimensionKind) -> &BTreeMap<i32, String> {
        match kind {
            DimensionKind::Category => &self.categories,
            DimensionKind::Developer => &self.developers,
        }
    }

    fn table_mut(&mut self, kind: DimensionKind) -> &mut BTreeMap<i32, String> {
        match kind {
            DimensionKind::Category => &mut self.categories,
            DimensionKind::Developer => &mut self.developers,
        }
    }

    fn id_for(&self, kind: DimensionKind, name: &str) -> Option<i32> {
        self.table(kind)
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    // Ids start at 1, like a SERIAL column.
    fn insert_name(&mut self, kind: DimensionKind, name: &str) -> i32 {
        let counter = match kind {
            DimensionKind::Category => &mut self.next_category_id,
            DimensionKind::Developer => &mut self.next_developer_id,
        };
        *counter += 1;
        let id = *counter;
        self.table_mut(kind).insert(id, name.to_string());
        id
    }

    fn check_references(&self, app: &Application) -> Result<(), StorageError> {
        if !self.categories.contains_key(&app.category_id)
            || !self.developers.contains_key(&app.developer_id)
        {
            return Err(StorageError::InvalidReference(format!(
                "app {} references an unknown category or developer",
                app.app_id
            )));
        }
        Ok(())
    }

    fn category_name(&self, app: &Application) -> &str {
        self.categories
            .get(&app.category_id)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// In-process store with the same conflict semantics as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_application_batches: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `insert_applications` call fail, to exercise an aborted load.
    pub fn with_failing_application_batches(mut self) -> Self {
        self.fail_application_batches = true;
        self
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn insert_dimension_names(
        &self,
        kind: DimensionKind,
        names: &[String],
    ) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0u64;
        for name in names {
            if state.id_for(kind, name).is_none() {
                state.insert_name(kind, name);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn dimension_ids(&self, kind: DimensionKind) -> Result<HashMap<String, i32>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .table(kind)
            .iter()
            .map(|(id, name)| (name.clone(), *id))
            .collect())
    }

    async fn insert_applications(&self, rows: &[Application]) -> Result<u64, StorageError> {
        if self.fail_application_batches {
            return Err(StorageError::Unavailable(
                "application batch rejected".to_string(),
            ));
        }
        let mut state = self.state.lock().await;
        // The whole batch is rejected before any write, like a rolled back transaction.
        for app in rows {
            state.check_references(app)?;
        }
        let mut inserted = 0u64;
        for app in rows {
            if !state.apps.contains_key(&app.app_id) {
                state.apps.insert(app.app_id.clone(), app.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn create_dimension(
        &self,
        kind: DimensionKind,
        name: &str,
    ) -> Result<Upsert<Dimension>, StorageError> {
        let mut state = self.state.lock().await;
        if let Some(id) = state.id_for(kind, name) {
            return Ok(Upsert::Existing(Dimension {
                id,
                name: name.to_string(),
            }));
        }
        let id = state.insert_name(kind, name);
        Ok(Upsert::Created(Dimension {
            id,
            name: name.to_string(),
        }))
    }

    async fn get_dimension(&self, kind: DimensionKind, id: i32) -> Result<Dimension, StorageError> {
        let state = self.state.lock().await;
        state
            .table(kind)
            .get(&id)
            .map(|name| Dimension {
                id,
                name: name.clone(),
            })
            .ok_or_else(|| StorageError::not_found(kind.label(), id))
    }

    async fn update_dimension(
        &self,
        kind: DimensionKind,
        id: i32,
        name: &str,
    ) -> Result<Dimension, StorageError> {
        let mut state = self.state.lock().await;
        if !state.table(kind).contains_key(&id) {
            return Err(StorageError::not_found(kind.label(), id));
        }
        if matches!(state.id_for(kind, name), Some(other) if other != id) {
            return Err(StorageError::Conflict(format!(
                "{} name {name:?} is already taken",
                kind.label()
            )));
        }
        state.table_mut(kind).insert(id, name.to_string());
        Ok(Dimension {
            id,
            name: name.to_string(),
        })
    }

    async fn delete_dimension(&self, kind: DimensionKind, id: i32) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if !state.table(kind).contains_key(&id) {
            return Err(StorageError::not_found(kind.label(), id));
        }
        let referenced = state.apps.values().any(|app| match kind {
            DimensionKind::Category => app.category_id == id,
            DimensionKind::Developer => app.developer_id == id,
        });
        if referenced {
            return Err(StorageError::Conflict(format!(
                "{} {id} is still referenced by applications",
                kind.label()
            )));
        }
        state.table_mut(kind).remove(&id);
        Ok(())
    }

    async fn create_application(&self, app: &Application) -> Result<Upsert<Application>, StorageError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.apps.get(&app.app_id) {
            return Ok(Upsert::Existing(existing.clone()));
        }
        state.check_references(app)?;
        state.apps.insert(app.app_id.clone(), app.clone());
        Ok(Upsert::Created(app.clone()))
    }

    async fn get_application(&self, app_id: &str) -> Result<Application, StorageError> {
        let state = self.state.lock().await;
        state
            .apps
            .get(app_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("app", app_id))
    }

    async fn update_application(
        &self,
        app_id: &str,
        app: &Application,
    ) -> Result<Application, StorageError> {
        let mut state = self.state.lock().await;
        if !state.apps.contains_key(app_id) {
            return Err(StorageError::not_found("app", app_id));
        }
        state.check_references(app)?;
        let mut row = app.clone();
        row.app_id = app_id.to_string();
        state.apps.insert(row.app_id.clone(), row.clone());
        Ok(row)
    }

    async fn delete_application(&self, app_id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .apps
            .remove(app_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found("app", app_id))
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn search_applications(&self, filter: &AppSearch) -> Result<Vec<AppSearchRow>, StorageError> {
        let state = self.state.lock().await;
        let rows = state
            .apps
            .values()
            .filter(|app| {
                matches!(app.attributes.rating, Some(r) if r >= filter.rating_min && r <= filter.rating_max)
            })
            .filter(|app| {
                filter.categories.is_empty()
                    || filter.categories.iter().any(|c| c == state.category_name(app))
            })
            .filter(|app| match filter.price {
                PriceFilter::All => true,
                PriceFilter::Free => app.attributes.price == Some(0.0),
                PriceFilter::Paid => matches!(app.attributes.price, Some(p) if p > 0.0),
            })
            .filter(|app| match &filter.content_rating {
                Some(wanted) => app.attributes.content_rating.as_deref() == Some(wanted.as_str()),
                None => true,
            })
            .take(usize::try_from(filter.limit.max(0)).unwrap_or(usize::MAX))
            .map(|app| AppSearchRow {
                app_id: app.app_id.clone(),
                app_name: app.name.clone(),
                category_name: state.category_name(app).to_string(),
                rating: app.attributes.rating,
                price: app.attributes.price,
                content_rating: app.attributes.content_rating.clone(),
                last_updated: app.attributes.last_updated,
                developer_name: state
                    .developers
                    .get(&app.developer_id)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        Ok(rows)
    }

    async fn free_applications(&self, categories: &[String]) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        let mut names = state
            .apps
            .values()
            .filter(|app| app.attributes.price == Some(0.0))
            .filter(|app| categories.iter().any(|c| c == state.category_name(app)))
            .filter_map(|app| app.name.clone())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    async fn yearly_counts(
        &self,
        categories: &[String],
        field: DateField,
    ) -> Result<Vec<YearCount>, StorageError> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::<i32, i64>::new();
        for app in state.apps.values() {
            if !categories.iter().any(|c| c == state.category_name(app)) {
                continue;
            }
            let date = match field {
                DateField::Released => app.attributes.released,
                DateField::LastUpdated => app.attributes.last_updated,
            };
            if let Some(date) = date {
                *counts.entry(date.year()).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(year, app_count)| YearCount { year, app_count })
            .collect())
    }

    async fn average_rating_by_category(&self) -> Result<Vec<CategoryRating>, StorageError> {
        let state = self.state.lock().await;
        let mut sums = BTreeMap::<String, (f64, u32)>::new();
        for app in state.apps.values() {
            let entry = sums.entry(state.category_name(app).to_string()).or_default();
            if let Some(rating) = app.attributes.rating {
                entry.0 += rating;
                entry.1 += 1;
            }
        }
        let mut out = sums
            .into_iter()
            .map(|(category, (sum, n))| CategoryRating {
                category,
                avg_rating: (n > 0).then(|| sum / f64::from(n)),
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| match (a.avg_rating, b.avg_rating) {
            (Some(x), Some(y)) => y.total_cmp(&x).then_with(|| a.category.cmp(&b.category)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.category.cmp(&b.category),
        });
        Ok(out)
    }

    async fn rating_distribution(&self) -> Result<Vec<RatingBucket>, StorageError> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::<i32, i64>::new();
        for rating in state.apps.values().filter_map(|app| app.attributes.rating) {
            *counts.entry(rating.floor() as i32).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(bucket, app_count)| RatingBucket { bucket, app_count })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use playdex_core::ApplicationAttributes;

    fn app(
        app_id: &str,
        category_id: i32,
        developer_id: i32,
        rating: Option<f64>,
        price: f64,
    ) -> Application {
        Application {
            app_id: app_id.to_string(),
            name: Some(format!("{app_id} name")),
            category_id,
            developer_id,
            attributes: ApplicationAttributes {
                rating,
                price: Some(price),
                free: price == 0.0,
                content_rating: Some("Everyone".into()),
                released: NaiveDate::from_ymd_opt(2020, 2, 26),
                last_updated: NaiveDate::from_ymd_opt(2021, 6, 1),
                ..Default::default()
            },
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_dimension_names(
                DimensionKind::Category,
                &["Tools".into(), "Social".into(), "Dating".into()],
            )
            .await
            .unwrap();
        store
            .insert_dimension_names(DimensionKind::Developer, &["Acme Inc".into()])
            .await
            .unwrap();
        store
            .insert_applications(&[
                app("com.tools.a", 1, 1, Some(4.5), 0.0),
                app("com.tools.b", 1, 1, Some(3.0), 1.99),
                app("com.social.a", 2, 1, Some(5.0), 0.0),
                app("com.dating.a", 3, 1, None, 0.0),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn dimension_inserts_are_insert_if_absent() {
        let store = MemoryStore::new();
        let names = vec!["Tools".to_string(), "Games".to_string()];
        assert_eq!(
            store.insert_dimension_names(DimensionKind::Category, &names).await.unwrap(),
            2
        );
        assert_eq!(
            store.insert_dimension_names(DimensionKind::Category, &names).await.unwrap(),
            0
        );
        let ids = store.dimension_ids(DimensionKind::Category).await.unwrap();
        assert_eq!(ids["Tools"], 1);
        assert_eq!(ids["Games"], 2);
    }

    #[tokio::test]
    async fn application_batch_with_dangling_reference_writes_nothing() {
        let store = seeded().await;
        let err = store
            .insert_applications(&[
                app("com.new.ok", 1, 1, None, 0.0),
                app("com.new.bad", 99, 1, None, 0.0),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidReference(_)));
        assert!(store.get_application("com.new.ok").await.is_err());
    }

    #[tokio::test]
    async fn first_application_write_wins() {
        let store = seeded().await;
        let mut replacement = app("com.tools.a", 1, 1, Some(1.0), 0.0);
        replacement.name = Some("Other".into());
        assert_eq!(store.insert_applications(&[replacement.clone()]).await.unwrap(), 0);
        let upsert = store.create_application(&replacement).await.unwrap();
        assert!(!upsert.created());
        assert_eq!(upsert.into_inner().attributes.rating, Some(4.5));
    }

    #[tokio::test]
    async fn dimension_crud_conflicts_and_not_found() {
        let store = seeded().await;
        assert!(matches!(
            store.get_dimension(DimensionKind::Category, 42).await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            store.update_dimension(DimensionKind::Category, 1, "Social").await,
            Err(StorageError::Conflict(_))
        ));
        assert!(matches!(
            store.delete_dimension(DimensionKind::Category, 1).await,
            Err(StorageError::Conflict(_))
        ));
        let created = store.create_dimension(DimensionKind::Category, "Weather").await.unwrap();
        assert!(created.created());
        let id = created.into_inner().id;
        store.delete_dimension(DimensionKind::Category, id).await.unwrap();
        assert!(store.get_dimension(DimensionKind::Category, id).await.is_err());
    }

    #[tokio::test]
    async fn update_application_keeps_path_key() {
        let store = seeded().await;
        let mut body = app("com.renamed", 2, 1, Some(2.0), 0.0);
        body.name = Some("Renamed".into());
        let updated = store.update_application("com.tools.a", &body).await.unwrap();
        assert_eq!(updated.app_id, "com.tools.a");
        assert_eq!(updated.category_id, 2);
        assert!(store.get_application("com.renamed").await.is_err());
        assert!(matches!(
            store.update_application("com.absent", &body).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn search_filters_by_category_price_and_rating() {
        let store = seeded().await;
        let rows = store
            .search_applications(&AppSearch {
                categories: vec!["Tools".into()],
                price: PriceFilter::Paid,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].app_id, "com.tools.b");
        assert_eq!(rows[0].developer_name, "Acme Inc");

        let unrated_excluded = store.search_applications(&AppSearch::default()).await.unwrap();
        assert_eq!(unrated_excluded.len(), 3);
    }

    #[tokio::test]
    async fn aggregates_match_the_seed() {
        let store = seeded().await;
        let free = store
            .free_applications(&["Social".into(), "Dating".into()])
            .await
            .unwrap();
        assert_eq!(free, vec!["com.dating.a name", "com.social.a name"]);

        let yearly = store
            .yearly_counts(&["Tools".into()], DateField::Released)
            .await
            .unwrap();
        assert_eq!(yearly, vec![YearCount { year: 2020, app_count: 2 }]);

        let averages = store.average_rating_by_category().await.unwrap();
        assert_eq!(averages[0].category, "Social");
        assert_eq!(averages[1].avg_rating, Some(3.75));
        assert_eq!(averages.last().unwrap().avg_rating, None);

        let buckets = store.rating_distribution().await.unwrap();
        assert_eq!(
            buckets,
            vec![
                RatingBucket { bucket: 3, app_count: 1 },
                RatingBucket { bucket: 4, app_count: 1 },
                RatingBucket { bucket: 5, app_count: 1 },
            ]
        );
    }
}
