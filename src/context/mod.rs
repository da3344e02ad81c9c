//! Per-request context: path parameters and named value injection.
//!
//! Plugins hand values to handlers through the context rather than through
//! extra function arguments: a plugin calls [`Context::inject`] under a
//! keyword, and the handler reads it back with [`Context::injected`] under the
//! same keyword. The database plugin uses this to pass its connection handle.

use std::{any::Any, collections::HashMap, sync::Arc};

use crate::Request;

/// Path parameters extracted from the matched route.
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }
}

// Values are stored type-erased and recovered with `Arc::downcast`.
type Injected = Arc<dyn Any + Send + Sync>;

/// Per-request context handed to every handler.
pub struct Context {
    request: Request,
    params: PathParams,
    injected: HashMap<String, Injected>,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self::with_params(request, PathParams::new())
    }

    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self {
            request,
            params,
            injected: HashMap::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Binds `value` to `keyword` for the rest of this request.
    ///
    /// A second injection under the same keyword replaces the first.
    pub fn inject<T>(&mut self, keyword: impl Into<String>, value: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        self.injected.insert(keyword.into(), value);
    }

    /// Returns the value bound to `keyword`, if one was injected with type `T`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use rttp_dal::{Context, Method, Request};
    ///
    /// let mut ctx = Context::new(Request::new(Method::Get, "/"));
    /// ctx.inject("greeting", Arc::new(String::from("hello")));
    ///
    /// let greeting = ctx.injected::<String>("greeting");
    /// assert_eq!(greeting.as_deref().map(String::as_str), Some("hello"));
    /// assert!(ctx.injected::<u32>("greeting").is_none());
    /// ```
    pub fn injected<T>(&self, keyword: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.injected
            .get(keyword)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Returns `true` if anything was injected under `keyword`.
    pub fn has_injected(&self, keyword: &str) -> bool {
        self.injected.contains_key(keyword)
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    fn ctx() -> Context {
        Context::new(Request::new(Method::Get, "/"))
    }

    #[test]
    fn injected_value_is_shared_not_copied() {
        let value = Arc::new(42_u64);
        let mut ctx = ctx();
        ctx.inject("answer", Arc::clone(&value));

        let seen = ctx.injected::<u64>("answer").unwrap();
        assert!(Arc::ptr_eq(&seen, &value));
        assert!(ctx.has_injected("answer"));
    }

    #[test]
    fn wrong_type_or_keyword_is_none() {
        let mut ctx = ctx();
        ctx.inject("db", Arc::new("handle"));
        assert!(ctx.injected::<String>("db").is_none());
        assert!(ctx.injected::<&str>("other").is_none());
        assert!(!ctx.has_injected("other"));
    }

    #[test]
    fn reinjection_replaces() {
        let mut ctx = ctx();
        ctx.inject("n", Arc::new(1_i32));
        ctx.inject("n", Arc::new(2_i32));
        assert_eq!(*ctx.injected::<i32>("n").unwrap(), 2);
    }

    #[test]
    fn json_body() {
        #[derive(serde::Deserialize)]
        struct Person {
            name: String,
        }
        let req = Request::new(Method::Post, "/people").with_body(r#"{"name":"James"}"#);
        let person: Person = Context::new(req).json().unwrap();
        assert_eq!(person.name, "James");
    }

    #[test]
    fn params_are_kept() {
        let mut params = PathParams::new();
        params.insert("id".into(), "7".into());
        let ctx = Context::with_params(Request::new(Method::Get, "/people/7"), params);
        assert_eq!(ctx.params().get("id"), Some("7"));
    }
}
