//! Handler trait and return-value conversion.
//!
//! Any async function whose arguments all implement
//! [`FromRequest`](crate::extractor::FromRequest) and whose return type implements
//! [`IntoResponse`] can be registered as a handler. Functions with up to eight
//! arguments are supported.
//!
//! Before binding arguments, a handler compares the number of route parameters its
//! arguments declare with the number the route extracted. A handler that declares
//! none runs immediately; otherwise the counts must agree, and a mismatch fails the
//! invocation with [`Error::ParameterArity`] without running the handler body.
//!
//! # Return values
//!
//! | Type | Response |
//! |------|----------|
//! | `()` | none; the handler wrote the response itself |
//! | `String`, `&'static str` | `text/plain` body |
//! | `Vec<u8>`, `Bytes` | `application/octet-stream` body |
//! | [`JsonResponse<T>`] | `application/json` body |
//! | `StatusCode` | empty body with that status |
//! | `(StatusCode, T)` | `T` with the given status |
//! | `Result<T>` | `T`, or the error propagated to the server |
//!
//! A returned body keeps the status the handler already set, `200` by default.
//!
//! # Examples
//!
//! ```
//! use routeforge_core::prelude::*;
//!
//! async fn created(Json(body): Json<serde_json::Value>) -> (StatusCode, JsonResponse<serde_json::Value>) {
//!     (StatusCode::CREATED, JsonResponse(body))
//! }
//!
//! async fn manual(ctx: HttpContext) -> Result<()> {
//!     ctx.response().set_header("X-Manual", "yes")?;
//!     ctx.text(StatusCode::OK, "written by hand")
//! }
//!
//! let router = Router::new()
//!     .post("/items", handler(created))
//!     .get("/manual", handler(manual));
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;
use tracing::error;

use crate::context::HttpContext;
use crate::error::{Error, Result};
use crate::extractor::{FromRequest, ParamCursor};
use crate::response::Response;

/// Writes a handler's return value into the response.
#[async_trait]
pub trait IntoResponse: Send {
    /// Performs the write.
    async fn into_response(self, response: &Response) -> Result<()>;
}

#[async_trait]
impl IntoResponse for () {
    async fn into_response(self, _response: &Response) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl IntoResponse for String {
    async fn into_response(self, response: &Response) -> Result<()> {
        response.send_body("text/plain; charset=utf-8", self)
    }
}

#[async_trait]
impl IntoResponse for &'static str {
    async fn into_response(self, response: &Response) -> Result<()> {
        response.send_body("text/plain; charset=utf-8", self)
    }
}

#[async_trait]
impl IntoResponse for Vec<u8> {
    async fn into_response(self, response: &Response) -> Result<()> {
        response.send_body("application/octet-stream", self)
    }
}

#[async_trait]
impl IntoResponse for Bytes {
    async fn into_response(self, response: &Response) -> Result<()> {
        response.send_body("application/octet-stream", self)
    }
}

#[async_trait]
impl IntoResponse for StatusCode {
    async fn into_response(self, response: &Response) -> Result<()> {
        response.send_status(self)
    }
}

#[async_trait]
impl<T: IntoResponse> IntoResponse for (StatusCode, T) {
    async fn into_response(self, response: &Response) -> Result<()> {
        response.set_status(self.0)?;
        self.1.into_response(response).await
    }
}

#[async_trait]
impl<T: IntoResponse> IntoResponse for Result<T> {
    async fn into_response(self, response: &Response) -> Result<()> {
        self?.into_response(response).await
    }
}

/// A value serialized as the JSON response body.
pub struct JsonResponse<T: Serialize>(pub T);

#[async_trait]
impl<T: Serialize + Send> IntoResponse for JsonResponse<T> {
    async fn into_response(self, response: &Response) -> Result<()> {
        let body = serde_json::to_vec(&self.0)?;
        response.send_body("application/json", body)
    }
}

/// A registered request handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Binds arguments from `ctx`, runs the handler and writes its result.
    async fn call(&self, ctx: HttpContext) -> Result<()>;

    /// Number of route parameters the handler's arguments consume.
    fn route_params(&self) -> usize {
        0
    }
}

/// Adapts an async function into a [`Handler`].
pub struct HandlerService<F, T> {
    handler: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> HandlerService<F, T> {
    /// Wraps `handler`.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

fn check_arity(ctx: &HttpContext, declared: usize) -> Result<()> {
    let extracted = ctx.params().len();
    if declared != 0 && declared != extracted {
        error!(
            route = ctx.request().route().unwrap_or_default(),
            path = ctx.request().path(),
            expected = declared,
            actual = extracted,
            "Route parameter count does not match the handler's parameters"
        );
        return Err(Error::ParameterArity {
            expected: declared,
            actual: extracted,
        });
    }
    Ok(())
}

macro_rules! impl_handler {
    (
        $($ty:ident),*
    ) => {
        #[allow(non_snake_case, unused_mut, unused_variables)]
        #[async_trait]
        impl<F, Fut, Res, $($ty,)*> Handler for HandlerService<F, ($($ty,)*)>
        where
            F: Fn($($ty,)*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: IntoResponse,
            $( $ty: FromRequest + Send + 'static, )*
        {
            async fn call(&self, ctx: HttpContext) -> Result<()> {
                check_arity(&ctx, self.route_params())?;

                let mut cursor = ParamCursor::new();
                $(
                    let $ty = <$ty as FromRequest>::from_request(&ctx, &mut cursor).await?;
                )*

                let response = (self.handler)($($ty,)*).await;
                response.into_response(ctx.response()).await
            }

            fn route_params(&self) -> usize {
                0 $( + <$ty as FromRequest>::ROUTE_PARAMS )*
            }
        }

        impl<F, Fut, Res, $($ty,)*> IntoHandler<($($ty,)*)> for F
        where
            F: Fn($($ty,)*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Res> + Send + 'static,
            Res: IntoResponse,
            $( $ty: FromRequest + Send + 'static, )*
        {
            type Handler = HandlerService<F, ($($ty,)*)>;

            fn into_handler(self) -> Self::Handler {
                HandlerService::new(self)
            }
        }
    };
}

/// Conversion of a function into a [`Handler`].
pub trait IntoHandler<T> {
    /// The handler type produced.
    type Handler: Handler;

    /// Performs the conversion.
    fn into_handler(self) -> Self::Handler;
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);
impl_handler!(T1, T2, T3, T4, T5);
impl_handler!(T1, T2, T3, T4, T5, T6);
impl_handler!(T1, T2, T3, T4, T5, T6, T7);
impl_handler!(T1, T2, T3, T4, T5, T6, T7, T8);

/// Converts an async function into a shareable handler.
///
/// ```
/// use routeforge_core::prelude::*;
///
/// async fn health() -> &'static str {
///     "ok"
/// }
///
/// let health_handler = handler(health);
/// assert_eq!(health_handler.route_params(), 0);
/// ```
pub fn handler<F, T>(f: F) -> Arc<dyn Handler>
where
    F: IntoHandler<T>,
{
    Arc::new(f.into_handler())
}
