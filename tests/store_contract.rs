#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use anyhow::Result;
use serde_json::{json, Value};

use cartera::model::{CLIENTES, EJECUTIVOS, STORE_INVALID_COLUMN, STORE_UNKNOWN_COLLECTION};
use cartera::{migrate, AppError, ChangeKind, Filter, OrderBy, StoreHandle};
use util::obj;

async fn both_backends() -> Vec<(&'static str, StoreHandle)> {
    vec![
        ("memory", StoreHandle::in_memory()),
        ("sqlite", util::sqlite_store().await),
    ]
}

fn id_of(row: &Value) -> i64 {
    row.get("id").and_then(Value::as_i64).expect("row id")
}

#[tokio::test]
async fn insert_assigns_ids_and_returns_persisted_row() -> Result<()> {
    for (backend, store) in both_backends().await {
        let first = store
            .insert(
                CLIENTES,
                obj(json!({ "mes_registro": 7, "anio_registro": 2025, "estatus": "Pendiente" })),
            )
            .await?;
        let second = store
            .insert(
                CLIENTES,
                obj(json!({
                    "id": 9999,
                    "mes_registro": 7,
                    "anio_registro": 2025,
                    "estatus": "En proceso"
                })),
            )
            .await?;

        assert_eq!(
            first.get("estatus"),
            Some(&json!("Pendiente")),
            "{backend}: insert returns the stored fields"
        );
        assert!(id_of(&second) > id_of(&first), "{backend}: ids grow");
        assert_ne!(id_of(&second), 9999, "{backend}: caller ids are ignored");
    }
    Ok(())
}

#[tokio::test]
async fn select_applies_filters_and_ordering() -> Result<()> {
    for (backend, store) in both_backends().await {
        for (mes, monto) in [(7, 200.0), (7, 50.0), (8, 900.0)] {
            store
                .insert(
                    CLIENTES,
                    obj(json!({ "mes_registro": mes, "anio_registro": 2025, "monto": monto })),
                )
                .await?;
        }

        let filters = [
            Filter::eq("mes_registro", 7),
            Filter::eq("anio_registro", 2025),
        ];
        let newest_first = store
            .select(CLIENTES, &filters, Some(&OrderBy::desc("id")))
            .await?;
        assert_eq!(newest_first.len(), 2, "{backend}: month filter applies");
        assert!(
            id_of(&newest_first[0]) > id_of(&newest_first[1]),
            "{backend}: descending id order"
        );

        let by_monto = store
            .select(CLIENTES, &filters, Some(&OrderBy::asc("monto")))
            .await?;
        assert_eq!(by_monto[0].get("monto"), Some(&json!(50.0)), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn update_patches_row_and_reports_misses() -> Result<()> {
    for (backend, store) in both_backends().await {
        let created = store
            .insert(
                CLIENTES,
                obj(json!({
                    "mes_registro": 7,
                    "anio_registro": 2025,
                    "estatus": "Pendiente",
                    "producto": "Moto X"
                })),
            )
            .await?;
        let id = id_of(&created);

        let updated = store
            .update(CLIENTES, id, obj(json!({ "estatus": "En proceso" })))
            .await?
            .expect("row exists");
        assert_eq!(updated.get("estatus"), Some(&json!("En proceso")), "{backend}");
        assert_eq!(
            updated.get("producto"),
            Some(&json!("Moto X")),
            "{backend}: untouched fields survive the patch"
        );

        let missing = store
            .update(CLIENTES, id + 1000, obj(json!({ "estatus": "x" })))
            .await?;
        assert!(missing.is_none(), "{backend}: patching an absent row is not an error");
    }
    Ok(())
}

#[tokio::test]
async fn empty_patch_reads_back_without_event() -> Result<()> {
    for (backend, store) in both_backends().await {
        let created = store
            .insert(CLIENTES, obj(json!({ "mes_registro": 7, "anio_registro": 2025 })))
            .await?;
        let id = id_of(&created);

        let mut feed = store.subscribe(CLIENTES, None);
        let row = store.update(CLIENTES, id, obj(json!({}))).await?;
        assert_eq!(row.map(|r| id_of(&r)), Some(id), "{backend}");
        assert!(
            feed.try_next().is_none(),
            "{backend}: no write happened, so no event"
        );
    }
    Ok(())
}

#[tokio::test]
async fn delete_removes_row_and_tolerates_absence() -> Result<()> {
    for (backend, store) in both_backends().await {
        let created = store
            .insert(CLIENTES, obj(json!({ "mes_registro": 7, "anio_registro": 2025 })))
            .await?;
        let id = id_of(&created);

        store.delete(CLIENTES, id).await?;
        let rows = store.select(CLIENTES, &[], None).await?;
        assert!(rows.is_empty(), "{backend}");

        store.delete(CLIENTES, id).await?;
    }
    Ok(())
}

#[tokio::test]
async fn feed_reports_writes_in_commit_order() -> Result<()> {
    for (backend, store) in both_backends().await {
        let mut feed = store.subscribe(CLIENTES, None);

        let created = store
            .insert(
                CLIENTES,
                obj(json!({ "mes_registro": 7, "anio_registro": 2025, "estatus": "Pendiente" })),
            )
            .await?;
        let id = id_of(&created);
        store
            .update(CLIENTES, id, obj(json!({ "estatus": "Dispersión" })))
            .await?;
        store.delete(CLIENTES, id).await?;

        let insert = feed.try_next().expect("insert event");
        assert_eq!(insert.kind, ChangeKind::Insert, "{backend}");
        assert_eq!(insert.new.as_ref().map(id_of), Some(id), "{backend}");

        let update = feed.try_next().expect("update event");
        assert_eq!(update.kind, ChangeKind::Update, "{backend}");
        assert_eq!(
            update.new.as_ref().and_then(|r| r.get("estatus")),
            Some(&json!("Dispersión")),
            "{backend}"
        );
        assert_eq!(
            update.old.as_ref().map(id_of),
            Some(id),
            "{backend}: update events identify the row in old"
        );

        let delete = feed.try_next().expect("delete event");
        assert_eq!(delete.kind, ChangeKind::Delete, "{backend}");
        assert_eq!(
            delete.old.as_ref().map(id_of),
            Some(id),
            "{backend}: delete events carry the removed row"
        );

        assert!(feed.try_next().is_none(), "{backend}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_writers_keep_feed_in_commit_order() -> Result<()> {
    for (backend, store) in both_backends().await {
        for trial in 0..4 {
            let created = store
                .insert(
                    CLIENTES,
                    obj(json!({ "mes_registro": 7, "anio_registro": 2025, "estatus": "w0" })),
                )
                .await?;
            let id = id_of(&created);
            let mut feed = store.subscribe(CLIENTES, None);

            let mut writers = Vec::new();
            for worker in 0..8 {
                let store = store.clone();
                writers.push(tokio::spawn(async move {
                    for round in 0..30 {
                        store
                            .update(
                                CLIENTES,
                                id,
                                obj(json!({ "estatus": format!("w{worker}-{round}") })),
                            )
                            .await?;
                    }
                    Ok::<(), AppError>(())
                }));
            }
            for writer in writers {
                writer.await??;
            }

            let mut delivered = 0usize;
            let mut last = None;
            while let Some(event) = feed.try_next() {
                assert_eq!(event.kind, ChangeKind::Update, "{backend}");
                delivered += 1;
                last = event.new;
            }
            assert_eq!(
                delivered, 240,
                "{backend} trial {trial}: every committed write is delivered"
            );

            let rows = store.select(CLIENTES, &[Filter::eq("id", id)], None).await?;
            assert_eq!(
                last.as_ref().and_then(|row| row.get("estatus")),
                rows[0].get("estatus"),
                "{backend} trial {trial}: the last delivered event carries the final row state"
            );
        }
    }
    Ok(())
}

#[tokio::test]
async fn feed_next_awaits_the_following_write() -> Result<()> {
    for (backend, store) in both_backends().await {
        let mut feed = store.subscribe(CLIENTES, None);
        assert_eq!(feed.collection(), CLIENTES, "{backend}");

        let writer = store.clone();
        let pending = tokio::spawn(async move {
            writer
                .insert(CLIENTES, obj(json!({ "mes_registro": 7, "anio_registro": 2025 })))
                .await
        });
        let event = feed.next().await.expect("insert delivered");
        assert_eq!(event.kind, ChangeKind::Insert, "{backend}");
        assert_eq!(event.collection, CLIENTES, "{backend}");
        pending.await??;
    }
    Ok(())
}

#[tokio::test]
async fn feed_filter_narrows_by_column_value() -> Result<()> {
    for (backend, store) in both_backends().await {
        let mut feed = store.subscribe(CLIENTES, Some(Filter::eq("anio_registro", 2025)));

        store
            .insert(CLIENTES, obj(json!({ "mes_registro": 7, "anio_registro": 2025 })))
            .await?;
        store
            .insert(CLIENTES, obj(json!({ "mes_registro": 7, "anio_registro": 2024 })))
            .await?;

        let only = feed.try_next().expect("matching insert delivered");
        assert_eq!(
            only.new.as_ref().and_then(|r| r.get("anio_registro")).and_then(Value::as_i64),
            Some(2025),
            "{backend}"
        );
        assert!(feed.try_next().is_none(), "{backend}: other years never delivered");
    }
    Ok(())
}

#[tokio::test]
async fn unknown_collections_are_refused() -> Result<()> {
    for (backend, store) in both_backends().await {
        let err = store
            .insert("facturas", obj(json!({ "mes_registro": 7 })))
            .await
            .unwrap_err();
        assert_eq!(err.code(), STORE_UNKNOWN_COLLECTION, "{backend}");

        let err = store.select("facturas", &[], None).await.unwrap_err();
        assert_eq!(err.code(), STORE_UNKNOWN_COLLECTION, "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn sqlite_rejects_non_identifier_columns() -> Result<()> {
    let store = util::sqlite_store().await;
    let err = store
        .select(
            CLIENTES,
            &[Filter::eq("mes_registro; DROP TABLE clientes", 7)],
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), STORE_INVALID_COLUMN);

    let err = store
        .select(CLIENTES, &[], Some(&OrderBy::desc("id, monto")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), STORE_INVALID_COLUMN);
    Ok(())
}

#[tokio::test]
async fn migrations_are_idempotent() -> Result<()> {
    let pool = util::temp_pool().await;
    // util::temp_pool already applied them once.
    migrate::apply_migrations(&pool).await?;

    let store = StoreHandle::sqlite(pool);
    let created = store
        .insert(EJECUTIVOS, obj(json!({ "mes": 7, "anio": 2025, "nombre": "Ana" })))
        .await?;
    assert_eq!(
        created.get("activo"),
        Some(&json!(1)),
        "schema default fills activo"
    );
    Ok(())
}
