//! Handler argument binding.
//!
//! Every handler argument implements [`FromRequest`]. Arguments that consume a route
//! parameter ([`Param<T>`]) declare it through [`FromRequest::ROUTE_PARAMS`]; the
//! handler checks the sum of those declarations against the number of parameters
//! the route extracted before binding anything.
//!
//! Route parameters bind positionally, in template order, through
//! [`FromRouteParam`]:
//!
//! - `String` always receives the raw path segment.
//! - When the inferred value already has the declared type it is used as is.
//! - Otherwise a lossless conversion is attempted (`"7"` inferred as `Int` binds to
//!   `u8`, `"2.0"` inferred as `Decimal` binds to `i64`). Values inferred as `BigInt`
//!   never convert to fixed-width numbers.
//!
//! A conversion failure ends the invocation with
//! [`Error::ParameterCoercion`](crate::error::Error::ParameterCoercion) before the
//! handler body runs.
//!
//! # Available extractors
//!
//! | Extractor | Provides |
//! |-----------|----------|
//! | [`Param<T>`] | the next route parameter, converted to `T` |
//! | [`Params`] | all route parameters |
//! | [`HttpContext`] | request, response and shared stores |
//! | [`Response`] | the response handle |
//! | [`State<T>`] | application state of type `T` |
//! | [`Json<T>`] | the request body as JSON |
//! | [`Body`] | the raw request body |
//! | [`Query`] | decoded query string pairs |
//! | `Arc<C>` | the shared instance of controller `C` |
//! | [`WebSocketUpgrade`](crate::websocket::WebSocketUpgrade) | a pending upgrade |
//!
//! # Examples
//!
//! ```
//! use routeforge_core::prelude::*;
//!
//! async fn show_post(Param(user): Param<u32>, Param(slug): Param<String>) -> String {
//!     format!("post {} by user {}", slug, user)
//! }
//!
//! let router = Router::new().get("/users/{user}/posts/{slug}", handler(show_post));
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use num_bigint::BigInt;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

use crate::context::HttpContext;
use crate::error::{Error, Result};
use crate::response::Response;
use crate::state::Controller;
use crate::template::{ParamValue, RouteParameter};

/// Position of the next route parameter to bind.
#[derive(Debug, Default)]
pub struct ParamCursor {
    next: usize,
}

impl ParamCursor {
    /// A cursor at the first parameter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next route parameter, if any is left.
    pub fn take<'a>(&mut self, ctx: &'a HttpContext) -> Option<&'a RouteParameter> {
        let param = ctx.params().get(self.next);
        if param.is_some() {
            self.next += 1;
        }
        param
    }
}

/// Builds a handler argument from the request context.
#[async_trait]
pub trait FromRequest: Sized {
    /// Number of route parameters this argument consumes.
    const ROUTE_PARAMS: usize = 0;

    /// Extracts the argument.
    async fn from_request(ctx: &HttpContext, cursor: &mut ParamCursor) -> Result<Self>;
}

/// Conversion of a typed route parameter into a handler argument type.
pub trait FromRouteParam: Sized + Send {
    /// Name reported in coercion errors.
    const TYPE_NAME: &'static str;

    /// Converts the parameter, or returns `None` if that would lose information.
    fn from_route_param(param: &RouteParameter) -> Option<Self>;
}

fn integral_decimal(value: &Decimal) -> Option<i128> {
    if value.fract().is_zero() {
        value.to_i128()
    } else {
        None
    }
}

fn integral_float(value: f64) -> Option<i128> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e38 {
        Some(value as i128)
    } else {
        None
    }
}

impl FromRouteParam for String {
    const TYPE_NAME: &'static str = "String";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        Some(param.raw().to_string())
    }
}

macro_rules! integer_route_param {
    ($($t:ty),* $(,)?) => {
        $(
            impl FromRouteParam for $t {
                const TYPE_NAME: &'static str = stringify!($t);

                fn from_route_param(param: &RouteParameter) -> Option<Self> {
                    match param.value() {
                        ParamValue::Int(v) => <$t>::try_from(*v).ok(),
                        ParamValue::Long(v) => <$t>::try_from(*v).ok(),
                        ParamValue::Decimal(v) => integral_decimal(v).and_then(|v| <$t>::try_from(v).ok()),
                        ParamValue::Double(v) => integral_float(*v).and_then(|v| <$t>::try_from(v).ok()),
                        ParamValue::Float(v) => integral_float(f64::from(*v)).and_then(|v| <$t>::try_from(v).ok()),
                        ParamValue::String(s) => s.parse().ok(),
                        ParamValue::BigInt(_) | ParamValue::Guid(_) | ParamValue::DateTime(_) => None,
                    }
                }
            }
        )*
    };
}

integer_route_param!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl FromRouteParam for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::Double(v) => Some(*v),
            ParamValue::Float(v) => Some(f64::from(*v)),
            ParamValue::Int(v) => Some(f64::from(*v)),
            ParamValue::Long(v) => Some(*v as f64),
            ParamValue::Decimal(v) => v.to_f64(),
            ParamValue::String(s) => s.parse().ok(),
            ParamValue::BigInt(_) | ParamValue::Guid(_) | ParamValue::DateTime(_) => None,
        }
    }
}

impl FromRouteParam for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Double(v) => {
                let narrowed = *v as f32;
                narrowed.is_finite().then_some(narrowed)
            }
            ParamValue::Int(v) => Some(*v as f32),
            ParamValue::Long(v) => Some(*v as f32),
            ParamValue::Decimal(v) => v.to_f32(),
            ParamValue::String(s) => s.parse().ok(),
            ParamValue::BigInt(_) | ParamValue::Guid(_) | ParamValue::DateTime(_) => None,
        }
    }
}

impl FromRouteParam for Decimal {
    const TYPE_NAME: &'static str = "Decimal";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::Decimal(v) => Some(*v),
            ParamValue::Int(v) => Some(Decimal::from(*v)),
            ParamValue::Long(v) => Some(Decimal::from(*v)),
            ParamValue::Double(v) => Decimal::from_f64(*v),
            ParamValue::Float(v) => Decimal::from_f32(*v),
            ParamValue::String(s) => s.parse().ok(),
            ParamValue::BigInt(_) | ParamValue::Guid(_) | ParamValue::DateTime(_) => None,
        }
    }
}

impl FromRouteParam for BigInt {
    const TYPE_NAME: &'static str = "BigInt";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::BigInt(v) => Some(v.clone()),
            ParamValue::Int(v) => Some(BigInt::from(*v)),
            ParamValue::Long(v) => Some(BigInt::from(*v)),
            ParamValue::Decimal(v) => integral_decimal(v).map(BigInt::from),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromRouteParam for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            ParamValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            ParamValue::Int(v) => Some(*v != 0),
            ParamValue::Long(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl FromRouteParam for Uuid {
    const TYPE_NAME: &'static str = "Uuid";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::Guid(v) => Some(*v),
            _ => Uuid::parse_str(param.raw()).ok(),
        }
    }
}

impl FromRouteParam for NaiveDateTime {
    const TYPE_NAME: &'static str = "NaiveDateTime";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::DateTime(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromRouteParam for NaiveDate {
    const TYPE_NAME: &'static str = "NaiveDate";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::DateTime(v) => Some(v.date()),
            _ => None,
        }
    }
}

impl FromRouteParam for DateTime<Utc> {
    const TYPE_NAME: &'static str = "DateTime<Utc>";

    fn from_route_param(param: &RouteParameter) -> Option<Self> {
        match param.value() {
            ParamValue::DateTime(v) => Some(v.and_utc()),
            _ => None,
        }
    }
}

/// The next route parameter, converted to `T`.
///
/// ```
/// use routeforge_core::prelude::*;
///
/// async fn get_order(Param(id): Param<u64>) -> String {
///     format!("order {}", id)
/// }
///
/// let router = Router::new().get("/orders/:id:", handler(get_order));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Param<T>(pub T);

#[async_trait]
impl<T: FromRouteParam + 'static> FromRequest for Param<T> {
    const ROUTE_PARAMS: usize = 1;

    async fn from_request(ctx: &HttpContext, cursor: &mut ParamCursor) -> Result<Self> {
        let param = cursor.take(ctx).ok_or(Error::ParameterArity {
            expected: cursor.next + 1,
            actual: ctx.params().len(),
        })?;
        match T::from_route_param(param) {
            Some(value) => Ok(Param(value)),
            None => {
                warn!(
                    route = ctx.request().route().unwrap_or_default(),
                    parameter = param.name(),
                    raw = param.raw(),
                    inferred = %param.kind(),
                    target = T::TYPE_NAME,
                    "Cannot bind route parameter"
                );
                Err(Error::ParameterCoercion {
                    name: param.name().to_string(),
                    raw: param.raw().to_string(),
                    target: T::TYPE_NAME,
                })
            }
        }
    }
}

/// All route parameters, without consuming any of them.
#[derive(Debug, Clone)]
pub struct Params(pub Vec<RouteParameter>);

impl Params {
    /// A parameter by name.
    pub fn get(&self, name: &str) -> Option<&RouteParameter> {
        self.0.iter().find(|p| p.name() == name)
    }
}

#[async_trait]
impl FromRequest for Params {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        Ok(Params(ctx.params().to_vec()))
    }
}

#[async_trait]
impl FromRequest for HttpContext {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        Ok(ctx.clone())
    }
}

#[async_trait]
impl FromRequest for Response {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        Ok(ctx.response().clone())
    }
}

/// Application state of type `T`.
pub struct State<T>(pub Arc<T>);

#[async_trait]
impl<T: Send + Sync + 'static> FromRequest for State<T> {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        ctx.state()
            .get::<T>()
            .ok_or_else(|| Error::extractor(format!("State not found: {}", std::any::type_name::<T>())))
            .map(State)
    }
}

/// The request body deserialized from JSON.
pub struct Json<T>(pub T);

#[async_trait]
impl<T: DeserializeOwned + Send> FromRequest for Json<T> {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        Ok(Json(ctx.request().json()?))
    }
}

/// The raw request body.
pub struct Body(pub Bytes);

#[async_trait]
impl FromRequest for Body {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        Ok(Body(ctx.request().body().clone()))
    }
}

/// Decoded query string pairs, in order.
#[derive(Debug, Clone, Default)]
pub struct Query(pub Vec<(String, String)>);

impl Query {
    /// The first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
impl FromRequest for Query {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        Ok(Query(ctx.request().query_pairs()))
    }
}

#[async_trait]
impl<C: Controller> FromRequest for Arc<C> {
    async fn from_request(ctx: &HttpContext, _cursor: &mut ParamCursor) -> Result<Self> {
        ctx.controllers().get_or_create::<C>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::response::Response;
    use crate::template::RouteTemplate;

    fn param(raw: &str) -> RouteParameter {
        RouteParameter::new("p", raw)
    }

    fn context(template: &str, path: &str) -> HttpContext {
        let mut request = Request::builder().target(path).build().unwrap();
        let params = RouteTemplate::new(template, request.path()).into_parameters();
        request.set_route(template.to_string(), params);
        HttpContext::new(request, Response::new())
    }

    #[test]
    fn test_string_gets_raw_value() {
        assert_eq!(String::from_route_param(&param("0042")).unwrap(), "0042");
        assert_eq!(String::from_route_param(&param("1.50")).unwrap(), "1.50");
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(i32::from_route_param(&param("123")), Some(123));
        assert_eq!(u8::from_route_param(&param("200")), Some(200));
        assert_eq!(u8::from_route_param(&param("300")), None);
        assert_eq!(i64::from_route_param(&param("5000000000")), Some(5_000_000_000));
        assert_eq!(i32::from_route_param(&param("5000000000")), None);
        assert_eq!(i64::from_route_param(&param("2.0")), Some(2));
        assert_eq!(i64::from_route_param(&param("2.5")), None);
        assert_eq!(i32::from_route_param(&param("abc")), None);
    }

    #[test]
    fn test_big_integers_never_narrow() {
        let big = param("123456789012345678901234567890");
        assert_eq!(i128::from_route_param(&big), None);
        assert_eq!(u128::from_route_param(&big), None);
        assert_eq!(f64::from_route_param(&big), None);
        assert!(BigInt::from_route_param(&big).is_some());
    }

    #[test]
    fn test_float_and_decimal_conversions() {
        assert_eq!(f64::from_route_param(&param("1.5")), Some(1.5));
        assert_eq!(f32::from_route_param(&param("2")), Some(2.0));
        assert_eq!(
            Decimal::from_route_param(&param("7")),
            Some(Decimal::from(7))
        );
    }

    #[test]
    fn test_bool_uuid_and_dates() {
        assert_eq!(bool::from_route_param(&param("TRUE")), Some(true));
        assert_eq!(bool::from_route_param(&param("1")), Some(true));
        assert_eq!(bool::from_route_param(&param("maybe")), None);

        let id = "6f9619ff-8b86-d011-b42d-00cf4fc964ff";
        assert_eq!(
            Uuid::from_route_param(&param(id)),
            Some(Uuid::parse_str(id).unwrap())
        );

        let date = NaiveDate::from_route_param(&param("2024-01-15")).unwrap();
        assert_eq!(date.to_string(), "2024-01-15");
        assert!(NaiveDateTime::from_route_param(&param("not-a-date")).is_none());
    }

    #[tokio::test]
    async fn test_param_extractor_consumes_in_order() {
        let ctx = context("/users/{id}/posts/{slug}", "/users/7/posts/hello");
        let mut cursor = ParamCursor::new();

        let Param(id) = Param::<u32>::from_request(&ctx, &mut cursor).await.unwrap();
        let Param(slug) = Param::<String>::from_request(&ctx, &mut cursor).await.unwrap();
        assert_eq!(id, 7);
        assert_eq!(slug, "hello");
    }

    #[tokio::test]
    async fn test_param_extractor_reports_coercion_failure() {
        let ctx = context("/users/{id}", "/users/bob");
        let mut cursor = ParamCursor::new();

        let err = Param::<u32>::from_request(&ctx, &mut cursor)
            .await
            .err()
            .unwrap();
        match err {
            Error::ParameterCoercion { name, raw, target } => {
                assert_eq!(name, "id");
                assert_eq!(raw, "bob");
                assert_eq!(target, "u32");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_state_extractor() {
        let ctx = context("/", "/");
        let state = crate::state::AppState::new();
        state.insert(Arc::new(41_u64));
        let ctx = ctx.with_state(state);

        let State(value) = State::<u64>::from_request(&ctx, &mut ParamCursor::new())
            .await
            .unwrap();
        assert_eq!(*value, 41);
        assert!(
            State::<String>::from_request(&ctx, &mut ParamCursor::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_query_and_params() {
        let ctx = context("/items/{id}", "/items/3?sort=asc");
        let Query(pairs) = Query::from_request(&ctx, &mut ParamCursor::new()).await.unwrap();
        assert_eq!(pairs, vec![("sort".to_string(), "asc".to_string())]);

        let params = Params::from_request(&ctx, &mut ParamCursor::new()).await.unwrap();
        assert_eq!(params.get("id").unwrap().raw(), "3");
    }
}
