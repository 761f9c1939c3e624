//! Demo item API served by the `brrtserve serve` command.
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/` | greeting |
//! | GET | `/health` | `{"status":"ok"}` |
//! | GET | `/items?skip=&limit=` | page of stored items |
//! | GET | `/items/{item_id}` | `{"id":..}` plus the stored item, if any |
//! | POST | `/items` | stores the item and echoes it back with its id |
//! | DELETE | `/items/{item_id}` | 204, or 404 when absent |
//!
//! Items live in an [`ItemStore`] behind the `db` provider; paging parameters
//! come from the `pagination` provider. A startup hook announces the start.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::dispatcher::{App, BodyType, ConfigError, HandlerError, Param, Primitive, Reply, Service};

fn default_quantity() -> u32 {
    1
}

/// Body of `POST /items`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Item {
    pub name: String,
    pub price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

/// In-memory item storage shared by all requests
#[derive(Debug, Default)]
pub struct ItemStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_id: i64,
    items: BTreeMap<i64, Item>,
}

impl ItemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, HandlerError> {
        self.inner
            .lock()
            .map_err(|_| HandlerError::internal("item store lock poisoned"))
    }

    /// Store `item` and return its id
    ///
    /// # Errors
    ///
    /// Fails only if a previous holder of the lock panicked.
    pub fn insert(&self, item: Item) -> Result<i64, HandlerError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.items.insert(id, item);
        Ok(id)
    }

    /// # Errors
    ///
    /// Fails only if a previous holder of the lock panicked.
    pub fn get(&self, id: i64) -> Result<Option<Item>, HandlerError> {
        Ok(self.lock()?.items.get(&id).cloned())
    }

    /// # Errors
    ///
    /// Fails only if a previous holder of the lock panicked.
    pub fn remove(&self, id: i64) -> Result<Option<Item>, HandlerError> {
        Ok(self.lock()?.items.remove(&id))
    }

    /// Items ordered by id
    ///
    /// # Errors
    ///
    /// Fails only if a previous holder of the lock panicked.
    pub fn list(&self, page: Pagination) -> Result<Vec<(i64, Item)>, HandlerError> {
        Ok(self
            .lock()?
            .items
            .iter()
            .skip(page.skip)
            .take(page.limit)
            .map(|(id, item)| (*id, item.clone()))
            .collect())
    }
}

/// Paging window for `GET /items`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub skip: usize,
    pub limit: usize,
}

const MAX_PAGE: usize = 100;

fn item_json(id: i64, item: &Item) -> Value {
    json!({
        "id": id,
        "name": item.name,
        "price": item.price,
        "quantity": item.quantity,
    })
}

/// The demo application over `store`
#[must_use]
pub fn app(store: Arc<ItemStore>) -> App {
    App::new()
        .on_startup("announce", || {
            info!("Application starting up");
            Ok(())
        })
        .provide("db", vec![], move |_req, _args| Ok(Arc::clone(&store)))
        .provide(
            "pagination",
            vec![
                Param::query_or("skip", Primitive::Int, "0"),
                Param::query_or("limit", Primitive::Int, "10"),
            ],
            |_req, args| {
                let (Ok(skip), Ok(limit)) = (
                    usize::try_from(*args.get::<i64>(0)?),
                    usize::try_from(*args.get::<i64>(1)?),
                ) else {
                    return Err(HandlerError::bad_request("skip and limit must not be negative"));
                };
                Ok(Pagination {
                    skip,
                    limit: limit.min(MAX_PAGE),
                })
            },
        )
        .get("/", vec![], |_req, _args| Ok(Reply::json(json!({ "message": "Hello, World!" }))))
        .get("/health", vec![], |_req, _args| Ok(Reply::json(json!({ "status": "ok" }))))
        .get(
            "/items",
            vec![Param::depends("db", "db"), Param::depends("page", "pagination")],
            |_req, args| {
                let store = args.get::<Arc<ItemStore>>(0)?;
                let page = *args.get::<Pagination>(1)?;
                let items: Vec<Value> = store
                    .list(page)?
                    .iter()
                    .map(|(id, item)| item_json(*id, item))
                    .collect();
                Ok(Reply::json(json!({
                    "skip": page.skip,
                    "limit": page.limit,
                    "items": items,
                })))
            },
        )
        .get(
            "/items/{item_id}",
            vec![Param::path("item_id", Primitive::Int), Param::depends("db", "db")],
            |_req, args| {
                let id = *args.get::<i64>(0)?;
                let store = args.named::<Arc<ItemStore>>("db")?;
                Ok(Reply::json(match store.get(id)? {
                    Some(item) => item_json(id, &item),
                    None => json!({ "id": id }),
                }))
            },
        )
        .post(
            "/items",
            vec![Param::body("item", BodyType::of::<Item>()), Param::depends("db", "db")],
            |_req, args| {
                let item = args.get::<Item>(0)?;
                let store = args.get::<Arc<ItemStore>>(1)?;
                let id = store.insert(item.clone())?;
                Ok(Reply::json(item_json(id, item)))
            },
        )
        .delete(
            "/items/{item_id}",
            vec![Param::path("item_id", Primitive::Int), Param::depends("db", "db")],
            |_req, args| {
                let id = *args.get::<i64>(0)?;
                let store = args.get::<Arc<ItemStore>>(1)?;
                match store.remove(id)? {
                    Some(_) => Ok(Reply::empty()),
                    None => Err(HandlerError::not_found(format!("Item {id} not found"))),
                }
            },
        )
}

/// Build the demo service with an empty store
///
/// # Errors
///
/// Only fails if the route table above is inconsistent.
pub fn service() -> Result<Service, ConfigError> {
    app(Arc::new(ItemStore::new())).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Request;
    use http::Method;

    fn body(resp: &crate::server::Response) -> Value {
        serde_json::from_slice(&resp.body).unwrap()
    }

    #[test]
    fn test_get_item_without_store_entry() {
        let service = service().unwrap();
        let resp = service.handle(&Request::new(Method::GET, "/items/7"));
        assert_eq!(resp.status, 200);
        assert_eq!(body(&resp), json!({ "id": 7 }));
    }

    #[test]
    fn test_post_then_get_and_delete() {
        let store = Arc::new(ItemStore::new());
        let service = app(Arc::clone(&store)).build().unwrap();

        let post = Request::new(Method::POST, "/items")
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"Widget","price":9.99}"#);
        let resp = service.handle(&post);
        assert_eq!(resp.status, 200);
        assert_eq!(body(&resp), json!({ "id": 1, "name": "Widget", "price": 9.99, "quantity": 1 }));

        let resp = service.handle(&Request::new(Method::GET, "/items/1"));
        assert_eq!(body(&resp)["name"], "Widget");

        let resp = service.handle(&Request::new(Method::DELETE, "/items/1"));
        assert_eq!(resp.status, 204);
        let resp = service.handle(&Request::new(Method::DELETE, "/items/1"));
        assert_eq!(resp.status, 404);
        assert_eq!(store.get(1).unwrap(), None);
    }

    #[test]
    fn test_list_pagination() {
        let store = Arc::new(ItemStore::new());
        for n in 0..5 {
            store
                .insert(Item {
                    name: format!("item-{n}"),
                    price: 1.0,
                    quantity: 1,
                })
                .unwrap();
        }
        let service = app(store).build().unwrap();

        let resp = service.handle(&Request::new(Method::GET, "/items?skip=1&limit=2"));
        let page = body(&resp);
        assert_eq!(page["skip"], 1);
        assert_eq!(page["limit"], 2);
        let ids: Vec<i64> = page["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 3]);

        let resp = service.handle(&Request::new(Method::GET, "/items?limit=-1"));
        assert_eq!(resp.status, 400);
    }

    #[test]
    fn test_missing_price_names_field() {
        let service = service().unwrap();
        let post = Request::new(Method::POST, "/items").with_body(r#"{"name":"Widget"}"#);
        let resp = service.handle(&post);
        assert_eq!(resp.status, 400);
        let err = body(&resp);
        assert_eq!(err["code"], "VALIDATION_FAILED");
        assert_eq!(err["fields"][0]["field"], "price");
    }
}
