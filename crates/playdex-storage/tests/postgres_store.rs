//! Runs only when DATABASE_URL points at a scratch Postgres database.

use playdex_core::{Application, ApplicationAttributes, DimensionKind};
use playdex_storage::{CatalogStore, DbConfig, PgStore};

async fn store() -> Option<PgStore> {
    std::env::var("DATABASE_URL").ok()?;
    let store = PgStore::connect(&DbConfig::from_env()).await.unwrap();
    store.migrate().await.unwrap();
    Some(store)
}

#[tokio::test]
async fn repeated_batches_insert_nothing_new() {
    let Some(store) = store().await else {
        return;
    };
    let suffix = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let category = format!("Tools {suffix}");
    let developer = format!("Acme {suffix}");

    for expected in [1, 0] {
        let inserted = store
            .insert_dimension_names(DimensionKind::Category, &[category.clone()])
            .await
            .unwrap();
        assert_eq!(inserted, expected);
        store
            .insert_dimension_names(DimensionKind::Developer, &[developer.clone()])
            .await
            .unwrap();
    }

    let category_id = store.dimension_ids(DimensionKind::Category).await.unwrap()[&category];
    let developer_id = store.dimension_ids(DimensionKind::Developer).await.unwrap()[&developer];
    let rows: Vec<Application> = (0..3)
        .map(|i| Application {
            app_id: format!("com.playdex.{suffix}.{i}"),
            name: Some(format!("App {i}")),
            category_id,
            developer_id,
            attributes: ApplicationAttributes {
                rating: Some(4.0),
                ..ApplicationAttributes::default()
            },
        })
        .collect();

    assert_eq!(store.insert_applications(&rows).await.unwrap(), 3);
    assert_eq!(store.insert_applications(&rows).await.unwrap(), 0);
    assert_eq!(store.get_application(&rows[0].app_id).await.unwrap(), rows[0]);

    for row in &rows {
        store.delete_application(&row.app_id).await.unwrap();
    }
    store.delete_dimension(DimensionKind::Category, category_id).await.unwrap();
    store.delete_dimension(DimensionKind::Developer, developer_id).await.unwrap();
    store.close().await;
}
