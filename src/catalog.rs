//! Per-entity reads and writes over the shared cache.
//!
//! Every write goes to the server first. Only a confirmed write touches the
//! cache: the server's record is patched into the cached list and the list
//! is invalidated so the next read reconciles with the server. Failed writes
//! leave the cache alone and produce exactly one error notification.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use crate::api::{
  ApiClient, ApiError, Brand, Headphone, HeadphoneType, Operation, RequestContext, Resource,
  WriteInput,
};
use crate::cache::{CacheLayer, CacheResult, QueryError};
use crate::notify::Notifier;
use crate::query::Query;

/// Entry point for catalog data: one transport, one cache, one notifier.
#[derive(Clone)]
pub struct Catalog {
  api: ApiClient,
  cache: CacheLayer,
  notifier: Arc<dyn Notifier>,
}

impl Catalog {
  pub fn new(api: ApiClient, cache: CacheLayer, notifier: Arc<dyn Notifier>) -> Self {
    Self {
      api,
      cache,
      notifier,
    }
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn collection<R: Resource>(&self) -> Collection<'_, R> {
    Collection {
      catalog: self,
      _marker: PhantomData,
    }
  }

  pub fn headphones(&self) -> Collection<'_, Headphone> {
    self.collection()
  }

  /// Send a message to the chat endpoint and return its reply.
  pub async fn chat(&self, message: &str) -> Result<String, ApiError> {
    if message.trim().is_empty() {
      return self.fail(ApiError::Invalid {
        context: RequestContext::new("chat", Operation::Chat),
        message: "Message is required".to_string(),
      });
    }

    match self.api.chat(message).await {
      Ok(reply) => Ok(reply),
      Err(err) => self.fail(err),
    }
  }

  fn fail<T>(&self, err: ApiError) -> Result<T, ApiError> {
    warn!(request = %err.context(), status = ?err.status(), error = %err, "Request failed");
    self.notifier.error(&err.user_message());
    Err(err)
  }

  /// Check that `id` names an existing record of `R`.
  ///
  /// The cached list is consulted first. When it doesn't know the id the
  /// server is asked once, outside the cache and without retries, so a
  /// write never waits on read backoff. If that read fails the check is
  /// skipped and the server decides.
  async fn ensure_exists<R: Resource>(&self, id: &str, context: &RequestContext) -> Result<(), ApiError> {
    let known = |list: &[R]| list.iter().any(|r| r.cache_key() == id);
    if let Ok(Some(cached)) = self.cache.get_query_data::<Vec<R>>(R::list_key()) {
      if known(&cached) {
        return Ok(());
      }
    }

    match self.api.list::<R>().await {
      Ok(list) if known(&list) => Ok(()),
      Ok(_) => Err(ApiError::Invalid {
        context: context.clone(),
        message: format!("Unknown {} '{}'", R::entity_type(), id),
      }),
      Err(err) => {
        warn!(request = %context, error = %err, "Could not verify {} reference", R::entity_type());
        Ok(())
      }
    }
  }
}

/// Operations on one entity collection, e.g. `catalog.collection::<Brand>()`.
pub struct Collection<'a, R> {
  catalog: &'a Catalog,
  _marker: PhantomData<fn() -> R>,
}

impl<R: Resource> Collection<'_, R> {
  fn list_fetcher(&self) -> impl Fn() -> BoxFuture<'static, Result<Vec<R>, ApiError>> + Send + Sync + 'static {
    let api = self.catalog.api.clone();
    move || {
      let api = api.clone();
      async move { api.list::<R>().await }.boxed()
    }
  }

  /// Read the list, serving cached data while it is fresh.
  pub async fn list(&self) -> Result<CacheResult<Vec<R>>, QueryError> {
    self
      .catalog
      .cache
      .fetch(R::list_key(), self.list_fetcher())
      .await
  }

  /// Read the list from the server, joining a fetch already in flight.
  pub async fn refresh(&self) -> Result<CacheResult<Vec<R>>, QueryError> {
    match self.catalog.cache.refetch(R::list_key()).await {
      Err(QueryError::Unregistered(_)) => self.list().await,
      other => other,
    }
  }

  /// Observe the list; it is refetched whenever a write invalidates it.
  pub fn subscribe(&self) -> Query<Vec<R>> {
    self
      .catalog
      .cache
      .subscribe(R::list_key(), self.list_fetcher())
  }

  /// The cached list, without touching the network.
  #[cfg(test)]
  pub fn cached(&self) -> Option<Arc<Vec<R>>> {
    self
      .catalog
      .cache
      .get_query_data(R::list_key())
      .ok()
      .flatten()
  }

  pub async fn create(&self, input: R::Input) -> Result<R, ApiError> {
    let context = RequestContext::new(R::entity_type(), Operation::Create);
    let result = match self.check(&input, &context).await {
      Ok(()) => self.catalog.api.create::<R>(&input).await,
      Err(err) => Err(err),
    };
    let record = result.or_else(|err| self.catalog.fail(err))?;

    self.commit(&context, |list| {
      let mut next = list.clone();
      next.push(record.clone());
      next
    });
    Ok(record)
  }

  /// Replace every mutable field of record `id`.
  pub async fn update(&self, id: &str, input: R::Input) -> Result<R, ApiError> {
    let context = RequestContext::new(R::entity_type(), Operation::Update).with_id(id);
    if id.trim().is_empty() {
      return self.catalog.fail(ApiError::Invalid {
        context,
        message: "Id is required".to_string(),
      });
    }

    let result = match self.check(&input, &context).await {
      Ok(()) => self.catalog.api.update::<R>(id, &input).await,
      Err(err) => Err(err),
    };
    let record = result.or_else(|err| self.catalog.fail(err))?;

    self.commit(&context, |list| {
      list
        .iter()
        .map(|item| {
          if item.cache_key() == id {
            record.clone()
          } else {
            item.clone()
          }
        })
        .collect()
    });
    Ok(record)
  }

  /// Delete record `id`. Deleting an id the cached list doesn't hold is
  /// fine; the list is left as it was.
  pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
    let context = RequestContext::new(R::entity_type(), Operation::Delete).with_id(id);
    if id.trim().is_empty() {
      return self.catalog.fail(ApiError::Invalid {
        context,
        message: "Id is required".to_string(),
      });
    }

    let ack = match self.catalog.api.delete::<R>(id).await {
      Ok(ack) => ack,
      Err(err) => return self.catalog.fail(err),
    };
    if let Some(message) = &ack.message {
      info!(request = %context, message = %message, "Server acknowledged delete");
    }

    self.commit(&context, |list| {
      list
        .iter()
        .filter(|item| item.cache_key() != id)
        .cloned()
        .collect()
    });
    Ok(())
  }

  /// Validate a write before it is sent.
  async fn check(&self, input: &R::Input, context: &RequestContext) -> Result<(), ApiError> {
    input.validate().map_err(|message| ApiError::Invalid {
      context: context.clone(),
      message,
    })?;

    if let Some(brand_id) = input.brand_ref() {
      self
        .catalog
        .ensure_exists::<Brand>(brand_id, context)
        .await?;
    }
    if let Some(type_id) = input.type_ref() {
      self
        .catalog
        .ensure_exists::<HeadphoneType>(type_id, context)
        .await?;
    }
    Ok(())
  }

  /// Apply a confirmed write to the cached list and report it.
  fn commit<F>(&self, context: &RequestContext, patch: F)
  where
    F: FnOnce(&Vec<R>) -> Vec<R>,
  {
    match self.catalog.cache.apply_write(R::list_key(), patch) {
      Ok(patched) => info!(request = %context, patched, "Write confirmed"),
      Err(err) => warn!(request = %context, error = %err, "Could not patch cached list"),
    }
    self.catalog.notifier.success(&format!(
      "{} {} successfully!",
      R::LABEL,
      context.operation.past()
    ));
  }
}
