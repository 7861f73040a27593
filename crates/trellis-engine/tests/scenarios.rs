//! End-to-end scenarios through the engine with the in-memory driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use trellis_core::datasource::{DataSource, SourceQuery, SourceResult};
use trellis_core::request::{FilterOperator, FilterPart, FilterTree, Request, Select};
use trellis_core::resource::DataSourceDescriptor;
use trellis_engine::extension::ItemEvent;
use trellis_engine::prelude::*;
use trellis_engine::MemoryDataSource;

/// An engine builder with the crate's tracing output routed through
/// the test writer, so warnings from assembly and drivers show up in
/// failing runs.
fn engine_builder(options: EngineOptions) -> EngineBuilder {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Engine::builder(options)
}

/// Counts backend calls on top of the in-memory driver.
#[derive(Default)]
struct CountingDriver {
    inner: MemoryDataSource,
    calls: AtomicUsize,
}

#[async_trait]
impl DataSource for CountingDriver {
    fn prepare(
        &self,
        descriptor: &mut DataSourceDescriptor,
        columns: &[String],
    ) -> trellis_core::Result<()> {
        self.inner.prepare(descriptor, columns)
    }

    async fn process(
        &self,
        query: &SourceQuery,
        cancel: &CancellationToken,
    ) -> trellis_core::Result<SourceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.process(query, cancel).await
    }
}

fn user_resource() -> Value {
    json!({
        "primaryKey": "id",
        "dataSources": {
            "primary": {
                "type": "memory",
                "data": [
                    {"id": 1, "username": "Alice"},
                    {"id": 2, "username": "Bob"},
                ],
            },
        },
        "attributes": {
            "id": {"type": "int"},
            "name": {"map": "username"},
        },
    })
}

fn article_resource(articles: Value, comments: Value) -> Value {
    json!({
        "primaryKey": "id",
        "dataSources": {"primary": {"type": "memory", "data": articles}},
        "attributes": {
            "id": {"type": "int"},
            "comments": {
                "primaryKey": "id",
                "parentKey": "id",
                "childKey": "articleId",
                "many": true,
                "dataSources": {"primary": {"type": "memory", "data": comments}},
                "attributes": {
                    "id": {"type": "int"},
                    "articleId": {"type": "int", "hidden": true},
                    "content": {},
                },
            },
        },
    })
}

#[tokio::test]
async fn single_resource_flat_select() {
    let engine = engine_builder(EngineOptions::default())
        .resource("u", user_resource())
        .build()
        .unwrap();

    let response = engine.execute(Request::new("u").with_id(1)).await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(response.meta.status_code, 200);
    assert_eq!(response.data, json!({"id": 1, "name": "Alice"}));
    assert!(response.cursor.is_none());
}

#[tokio::test]
async fn single_resource_not_found() {
    let engine = engine_builder(EngineOptions::default())
        .resource("u", user_resource())
        .build()
        .unwrap();

    let response = engine.execute(Request::new("u").with_id(999)).await;

    assert_eq!(response.meta.status_code, 404);
    assert!(response.error.is_some());
    assert_eq!(response.data, Value::Null);
}

#[tokio::test]
async fn one_to_many_relation() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "article",
            article_resource(
                json!([{"id": 1}, {"id": 2}, {"id": 3}]),
                json!([
                    {"id": 10, "articleId": 1, "content": "c1"},
                    {"id": 11, "articleId": 1, "content": "c2"},
                    {"id": 12, "articleId": 2, "content": "c3"},
                ]),
            ),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(
            Request::new("article").with_select(Select::parse("id,comments[content]").unwrap()),
        )
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(response.cursor.as_ref().unwrap().total_count, Some(3));
    assert_eq!(
        response.data,
        json!([
            {"id": 1, "comments": [{"content": "c1"}, {"content": "c2"}]},
            {"id": 2, "comments": [{"content": "c3"}]},
            {"id": 3, "comments": []},
        ])
    );
}

#[tokio::test]
async fn many_to_many_via_join_table() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "article",
            json!({
                "primaryKey": "id",
                "dataSources": {"primary": {"type": "memory", "data": [{"id": 1}]}},
                "attributes": {
                    "id": {"type": "int"},
                    "categories": {
                        "primaryKey": "id",
                        "parentKey": "id",
                        "childKey": "id",
                        "many": true,
                        "joinVia": "articleCategories",
                        "dataSources": {
                            "primary": {
                                "type": "memory",
                                "data": [
                                    {"id": 10, "name": "rust"},
                                    {"id": 20, "name": "engines"},
                                ],
                            },
                            "articleCategories": {
                                "type": "memory",
                                "joinParentKey": "articleId",
                                "joinChildKey": "categoryId",
                                "data": [
                                    {"articleId": 1, "categoryId": 20, "sortOrder": 1},
                                    {"articleId": 1, "categoryId": 10, "sortOrder": 2},
                                ],
                            },
                        },
                        "attributes": {
                            "id": {"type": "int"},
                            "name": {},
                            "articleId": {
                                "type": "int", "hidden": true,
                                "map": {"articleCategories": "articleId"},
                            },
                            "categoryId": {
                                "type": "int", "hidden": true,
                                "map": {"articleCategories": "categoryId"},
                            },
                            "order": {
                                "type": "int",
                                "map": {"articleCategories": "sortOrder"},
                            },
                        },
                    },
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(
            Request::new("article")
                .with_select(Select::parse("id,categories[name,order]").unwrap()),
        )
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    // Join-row sequence defines the child order; the join row's own
    // column rides along on each child.
    assert_eq!(
        response.data,
        json!([{
            "id": 1,
            "categories": [
                {"name": "engines", "order": 1},
                {"name": "rust", "order": 2},
            ],
        }])
    );
}

fn filtered_article_engine(driver: Arc<CountingDriver>) -> Engine {
    engine_builder(EngineOptions::default())
        .data_source("memory", driver)
        .resource(
            "article",
            json!({
                "primaryKey": "id",
                "subFilters": [
                    {"attribute": "author.groupId", "filter": "equal"},
                ],
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [
                            {"id": 1, "authorId": 100},
                            {"id": 2, "authorId": 101},
                            {"id": 3, "authorId": 100},
                        ],
                    },
                },
                "attributes": {
                    "id": {"type": "int"},
                    "authorId": {"type": "int", "hidden": true},
                    "author": {
                        "parentKey": "authorId",
                        "childKey": "id",
                        "primaryKey": "id",
                        "dataSources": {
                            "primary": {
                                "type": "memory",
                                "data": [
                                    {"id": 100, "groupId": 7, "username": "a"},
                                    {"id": 101, "groupId": 8, "username": "b"},
                                ],
                            },
                        },
                        "attributes": {
                            "id": {"type": "int"},
                            "groupId": {"type": "int", "filter": "equal"},
                            "name": {"map": "username"},
                        },
                    },
                },
            }),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn sub_filter_substitution() {
    let driver = Arc::new(CountingDriver::default());
    let engine = filtered_article_engine(driver.clone());

    let response = engine
        .execute(
            Request::new("article")
                .with_select(Select::parse("id").unwrap())
                .with_filter(FilterTree::single(FilterPart::new(
                    "author.groupId",
                    FilterOperator::Equal,
                    7,
                ))),
        )
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(response.data, json!([{"id": 1}, {"id": 3}]));
    // Author key collection plus the constrained main query.
    assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_sub_filter_skips_backend() {
    let driver = Arc::new(CountingDriver::default());
    let engine = filtered_article_engine(driver.clone());

    let response = engine
        .execute(
            Request::new("article")
                .with_select(Select::parse("id").unwrap())
                .with_filter(FilterTree::single(FilterPart::new(
                    "author.groupId",
                    FilterOperator::Equal,
                    999,
                ))),
        )
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(response.data, json!([]));
    assert_eq!(response.cursor.as_ref().unwrap().total_count, Some(0));
    // Only the key-collecting query ran; the main request was
    // skipped.
    assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn datetime_cast_with_stored_timezone() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "event",
            json!({
                "primaryKey": "id",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [{"id": 1, "ts": "2015-03-03 15:00:00"}],
                    },
                },
                "attributes": {
                    "id": {"type": "int"},
                    "ts": {
                        "type": "datetime",
                        "storedType": "datetime(timezone=Europe/Berlin)",
                    },
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine.execute(Request::new("event").with_id(1)).await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(
        response.data,
        json!({"id": 1, "ts": "2015-03-03T14:00:00.000Z"})
    );
}

#[tokio::test]
async fn secondary_data_source_joined_by_primary_key() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "article",
            json!({
                "primaryKey": "id",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [{"id": 1, "title": "One"}, {"id": 2, "title": "Two"}],
                    },
                    "fulltext": {
                        "type": "memory",
                        "data": [{"id": 1, "teaser": "first"}, {"id": 2, "teaser": "second"}],
                    },
                },
                "attributes": {
                    "id": {"type": "int", "map": {"primary": "id", "fulltext": "id"}},
                    "title": {},
                    "teaser": {"map": {"fulltext": "teaser"}},
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(Request::new("article").with_select(Select::parse("id,title,teaser").unwrap()))
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(
        response.data,
        json!([
            {"id": 1, "title": "One", "teaser": "first"},
            {"id": 2, "title": "Two", "teaser": "second"},
        ])
    );
}

#[tokio::test]
async fn multi_valued_parent_key_dereferences_elements() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "article",
            json!({
                "primaryKey": "id",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [{"id": 1, "tagIds": [20, 10]}, {"id": 2, "tagIds": []}],
                    },
                },
                "attributes": {
                    "id": {"type": "int"},
                    "tagIds": {"type": "int", "multiValued": true, "hidden": true},
                    "tags": {
                        "primaryKey": "id",
                        "parentKey": "tagIds",
                        "childKey": "id",
                        "many": true,
                        "dataSources": {
                            "primary": {
                                "type": "memory",
                                "data": [
                                    {"id": 10, "name": "rust"},
                                    {"id": 20, "name": "engines"},
                                ],
                            },
                        },
                        "attributes": {
                            "id": {"type": "int"},
                            "name": {},
                        },
                    },
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(Request::new("article").with_select(Select::parse("id,tags[name]").unwrap()))
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    // Element order of the key array defines the child order.
    assert_eq!(
        response.data,
        json!([
            {"id": 1, "tags": [{"name": "engines"}, {"name": "rust"}]},
            {"id": 2, "tags": []},
        ])
    );
}

#[tokio::test]
async fn search_selects_searchable_source() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "article",
            json!({
                "primaryKey": "id",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [
                            {"id": 1, "title": "Rust engine"},
                            {"id": 2, "title": "Unrelated"},
                        ],
                    },
                    "fulltext": {
                        "type": "memory",
                        "searchable": true,
                        "data": [
                            {"id": 1, "title": "Rust engine"},
                            {"id": 2, "title": "Unrelated"},
                        ],
                    },
                },
                "attributes": {
                    "id": {"type": "int", "map": {"primary": "id", "fulltext": "id"}},
                    "title": {"map": {"primary": "title", "fulltext": "title"}},
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(
            Request::new("article")
                .with_select(Select::parse("id,title").unwrap())
                .with_search("rust"),
        )
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(response.data, json!([{"id": 1, "title": "Rust engine"}]));
}

#[tokio::test]
async fn pagination_cursor() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "item",
            json!({
                "primaryKey": "id",
                "maxLimit": 50,
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [
                            {"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}, {"id": 5},
                        ],
                    },
                },
                "attributes": {"id": {"type": "int"}},
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(Request::new("item").with_limit(2).with_page(2))
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(response.data, json!([{"id": 3}, {"id": 4}]));
    let cursor = response.cursor.unwrap();
    assert_eq!(cursor.total_count, Some(5));
    assert_eq!(cursor.page, Some(2));
    assert_eq!(cursor.limit, Some(2));
    assert_eq!(cursor.total_page, Some(3));
}

#[tokio::test]
async fn item_extension_mutates_items() {
    struct FullName;

    impl Extension for FullName {
        fn item(&self, event: &mut ItemEvent<'_>) -> trellis_core::Result<()> {
            let name = event
                .item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            event.item.insert("greeting".into(), json!(format!("hello {name}")));
            Ok(())
        }
    }

    let engine = engine_builder(EngineOptions::default())
        .resource("u", user_resource())
        .extension_for("u", Arc::new(FullName))
        .build()
        .unwrap();

    let response = engine.execute(Request::new("u").with_id(1)).await;
    assert_eq!(
        response.data,
        json!({"id": 1, "name": "Alice", "greeting": "hello Alice"})
    );
}

#[tokio::test]
async fn profile_and_explain_metadata() {
    let options: EngineOptions = serde_json::from_value(json!({"allowExplain": true})).unwrap();
    let engine = engine_builder(options)
        .resource("u", user_resource())
        .build()
        .unwrap();

    let mut request = Request::new("u");
    request.explain = true;
    request.profile = trellis_core::ProfileMode::Raw;
    let response = engine.execute(request).await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    let profile = response.meta.profile.as_ref().unwrap();
    assert_eq!(profile["name"], "request");
    let explain = response.meta.explain.as_ref().unwrap();
    assert_eq!(explain["request"], "root:primary");
    assert_eq!(explain["rows"], 2);
    assert!(response.meta.duration.is_some());
}

#[tokio::test]
async fn request_errors_surface_with_status() {
    let engine = engine_builder(EngineOptions::default())
        .resource("u", user_resource())
        .build()
        .unwrap();

    let response = engine
        .execute(Request::new("u").with_select(Select::parse("nope").unwrap()))
        .await;
    assert_eq!(response.meta.status_code, 400);
    assert!(response
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("unknown attribute"));

    let response = engine.execute(Request::new("nope")).await;
    assert_eq!(response.meta.status_code, 404);
}

#[tokio::test]
async fn n_to_one_relation_builds_nested_object() {
    let engine = engine_builder(EngineOptions::default())
        .resource("user", user_resource())
        .resource(
            "article",
            json!({
                "primaryKey": "id",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [
                            {"id": 1, "authorId": 1},
                            {"id": 2, "authorId": null},
                        ],
                    },
                },
                "attributes": {
                    "id": {"type": "int"},
                    "authorId": {"type": "int", "hidden": true},
                    "author": {
                        "resource": "user",
                        "parentKey": "authorId",
                        "childKey": "{primary}",
                    },
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(Request::new("article").with_select(Select::parse("id,author[name]").unwrap()))
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(
        response.data,
        json!([
            {"id": 1, "author": {"name": "Alice"}},
            {"id": 2, "author": null},
        ])
    );
}

#[tokio::test]
async fn composite_parent_key_relation() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "product",
            json!({
                "primaryKey": "id",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [
                            {"id": 1, "region": "eu"},
                            {"id": 2, "region": "us"},
                        ],
                    },
                },
                "attributes": {
                    "id": {"type": "int"},
                    "region": {},
                    "stock": {
                        "primaryKey": "warehouseId",
                        "parentKey": "id,region",
                        "childKey": "productId,region",
                        "many": true,
                        "dataSources": {
                            "primary": {
                                "type": "memory",
                                "data": [
                                    {"warehouseId": 1, "productId": 1, "region": "eu", "amount": 12},
                                    {"warehouseId": 2, "productId": 1, "region": "us", "amount": 7},
                                    {"warehouseId": 3, "productId": 2, "region": "us", "amount": 3},
                                ],
                            },
                        },
                        "attributes": {
                            "warehouseId": {"type": "int", "hidden": true},
                            "productId": {"type": "int", "hidden": true},
                            "region": {"hidden": true},
                            "amount": {"type": "int"},
                        },
                    },
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(Request::new("product").with_select(Select::parse("id,stock[amount]").unwrap()))
        .await;

    assert!(response.error.is_none(), "error: {:?}", response.error);
    assert_eq!(
        response.data,
        json!([
            {"id": 1, "stock": [{"amount": 12}]},
            {"id": 2, "stock": [{"amount": 3}]},
        ])
    );
}

#[tokio::test]
async fn delimiter_splits_stored_strings() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "article",
            json!({
                "primaryKey": "id",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [{"id": 1, "keywords": "rust,engine,query"}],
                    },
                },
                "attributes": {
                    "id": {"type": "int"},
                    "keywords": {"delimiter": ","},
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine.execute(Request::new("article").with_id(1)).await;
    assert_eq!(
        response.data,
        json!({"id": 1, "keywords": ["rust", "engine", "query"]})
    );
}

#[tokio::test]
async fn default_order_applies_without_request_order() {
    let engine = engine_builder(EngineOptions::default())
        .resource(
            "item",
            json!({
                "primaryKey": "id",
                "defaultOrder": "rank:desc",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [
                            {"id": 1, "rank": 5},
                            {"id": 2, "rank": 9},
                            {"id": 3, "rank": 1},
                        ],
                    },
                },
                "attributes": {
                    "id": {"type": "int"},
                    "rank": {"type": "int", "order": true},
                },
            }),
        )
        .build()
        .unwrap();

    let response = engine
        .execute(Request::new("item").with_select(Select::parse("id").unwrap()))
        .await;
    assert_eq!(response.data, json!([{"id": 2}, {"id": 1}, {"id": 3}]));
}

#[tokio::test]
async fn internal_errors_are_masked_unless_exposed() {
    // Two author rows share the unique child key, a data error at
    // assembly time.
    let broken = json!({
        "primaryKey": "id",
        "dataSources": {
            "primary": {"type": "memory", "data": [{"id": 1, "authorId": 7}]},
        },
        "attributes": {
            "id": {"type": "int"},
            "authorId": {"type": "int", "hidden": true},
            "author": {
                "primaryKey": "uid",
                "parentKey": "authorId",
                "childKey": "uid",
                "dataSources": {
                    "primary": {
                        "type": "memory",
                        "data": [{"uid": 7, "name": "a"}, {"uid": 7, "name": "b"}],
                    },
                },
                "attributes": {
                    "uid": {"type": "int", "hidden": true},
                    "name": {},
                },
            },
        },
    });

    let engine = engine_builder(EngineOptions::default())
        .resource("article", broken.clone())
        .build()
        .unwrap();
    let response = engine
        .execute(Request::new("article").with_select(Select::parse("id,author[name]").unwrap()))
        .await;
    assert_eq!(response.meta.status_code, 500);
    assert_eq!(response.error.as_ref().unwrap().message, "Internal Server Error");

    let options: EngineOptions = serde_json::from_value(json!({"exposeErrors": true})).unwrap();
    let engine = engine_builder(options)
        .resource("article", broken)
        .build()
        .unwrap();
    let response = engine
        .execute(Request::new("article").with_select(Select::parse("id,author[name]").unwrap()))
        .await;
    assert_eq!(response.meta.status_code, 500);
    assert!(response
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("duplicate unique child key"));
}

#[tokio::test]
async fn engine_close_is_idempotent() {
    let engine = engine_builder(EngineOptions::default())
        .resource("u", user_resource())
        .build()
        .unwrap();

    engine.close().await.unwrap();
    engine.close().await.unwrap();
}
