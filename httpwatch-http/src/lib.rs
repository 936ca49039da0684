//! HTTP client adapters for `httpwatch`.
//!
//! Each supported client implements [`HttpClient`] and [`TargetLibrary`].
//! [`install`] wires the interception hook for a client type once per
//! process; an [`InstrumentedClient`] then routes every request through the
//! hook, which captures it whenever the library is enabled in the registry.
//!
//! ```no_run
//! # #[cfg(feature = "reqwest")]
//! # async fn run() -> Result<(), httpwatch_http::HttpError> {
//! use httpwatch_http::{install, Bytes, HttpClient, InstrumentedClient, Request};
//!
//! install::<reqwest::Client>()?;
//! let client = InstrumentedClient::new(reqwest::Client::new());
//! let request = Request::get("https://api.example.com/users").body(Bytes::new())?;
//! let response = client.send_bytes(request).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```
use async_trait::async_trait;
use httpwatch::registry::{InstallOutcome, Registry};
use httpwatch::sink::{RequestSummary, ResponseSummary};
use httpwatch::{httpwatch_debug, Interceptor, Library};
use std::fmt::Debug;
use std::sync::{Arc, OnceLock};

#[doc(no_inline)]
pub use bytes::Bytes;
#[doc(no_inline)]
pub use http::{Request, Response};

/// Error type returned by [`HttpClient`] implementations.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A minimal interface necessary for sending requests over HTTP.
///
/// Users sometime choose HTTP clients that relay on a certain async runtime. This trait allows
/// users to bring their choice of HTTP client.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send the specified HTTP request with `Bytes` payload.
    ///
    /// Returns the HTTP response including the status code and body.
    ///
    /// Returns an error if it can't connect to the server or the request could not be completed,
    /// e.g. because of a timeout, infinite redirects, or a loss of connection.
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}

/// The target library a client type belongs to.
pub trait TargetLibrary {
    /// Library whose hook captures calls made by this client.
    const LIBRARY: Library;
}

// Interceptors wired by `install`, one slot per library. A slot is written
// once, by the first registry that installs the library.
static HOOKS: [OnceLock<Interceptor>; Library::COUNT] =
    [OnceLock::new(), OnceLock::new(), OnceLock::new()];

/// Installs the interception hook for client type `C` in the global
/// registry.
///
/// Safe to call any number of times from any thread: the hook is wired once.
pub fn install<C: TargetLibrary>() -> httpwatch::Result<InstallOutcome> {
    install_in::<C>(&httpwatch::global::registry())
}

/// Installs the interception hook for client type `C` in `registry`.
pub fn install_in<C: TargetLibrary>(
    registry: &Arc<Registry>,
) -> httpwatch::Result<InstallOutcome> {
    registry.install(C::LIBRARY, || {
        let interceptor = Interceptor::new(C::LIBRARY, Arc::clone(registry));
        if HOOKS[C::LIBRARY.index()].set(interceptor).is_ok() {
            httpwatch_debug!(name: "Hook.Wired", library = C::LIBRARY.name());
        } else {
            httpwatch_debug!(name: "Hook.AlreadyWired", library = C::LIBRARY.name());
        }
        Ok(())
    })
}

/// The interceptor wired for `library`, if its hook was installed.
pub fn hook(library: Library) -> Option<Interceptor> {
    HOOKS[library.index()].get().cloned()
}

/// An [`HttpClient`] whose requests go through the interception hook.
///
/// Without an installed hook the client passes requests straight through.
#[derive(Clone, Debug)]
pub struct InstrumentedClient<C> {
    inner: C,
    interceptor: Option<Interceptor>,
}

impl<C: TargetLibrary> InstrumentedClient<C> {
    /// Wraps `inner`, using the hook wired by [`install`] for its library.
    pub fn new(inner: C) -> Self {
        InstrumentedClient {
            inner,
            interceptor: None,
        }
    }

    /// Wraps `inner`, routing requests through `interceptor`.
    pub fn with_interceptor(inner: C, interceptor: Interceptor) -> Self {
        InstrumentedClient {
            inner,
            interceptor: Some(interceptor),
        }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn interceptor(&self) -> Option<Interceptor> {
        self.interceptor.clone().or_else(|| hook(C::LIBRARY))
    }
}

#[async_trait]
impl<C> HttpClient for InstrumentedClient<C>
where
    C: HttpClient + TargetLibrary,
{
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let Some(interceptor) = self.interceptor() else {
            return self.inner.send_bytes(request).await;
        };
        let summary = summarize_request(&request);
        interceptor
            .intercept_async(summary, self.inner.send_bytes(request), summarize_response)
            .await
    }
}

/// Describes `request` for the capture sink.
pub fn summarize_request(request: &Request<Bytes>) -> RequestSummary {
    RequestSummary {
        method: request.method().to_string(),
        url: request.uri().to_string(),
        headers: header_pairs(request.headers()),
        body: request.body().to_vec(),
    }
}

/// Describes the outcome of a request for the capture sink.
pub fn summarize_response(outcome: &Result<Response<Bytes>, HttpError>) -> ResponseSummary {
    match outcome {
        Ok(response) => ResponseSummary {
            status: Some(response.status().as_u16()),
            headers: header_pairs(response.headers()),
            body: response.body().to_vec(),
            error: None,
        },
        Err(err) => ResponseSummary::failed(err),
    }
}

fn header_pairs(headers: &http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[cfg(feature = "reqwest")]
mod reqwest {
    use httpwatch::{httpwatch_debug, Library};

    use super::{
        async_trait, summarize_request, summarize_response, Bytes, HttpClient, HttpError,
        InstrumentedClient, Request, Response, TargetLibrary,
    };

    impl TargetLibrary for reqwest::Client {
        const LIBRARY: Library = Library::Reqwest;
    }

    #[async_trait]
    impl HttpClient for reqwest::Client {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            httpwatch_debug!(name: "ReqwestClient.Send");
            let request = request.try_into()?;
            let mut response = self.execute(request).await?;
            let headers = std::mem::take(response.headers_mut());
            let mut http_response = Response::builder()
                .status(response.status())
                .body(response.bytes().await?)?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    impl TargetLibrary for reqwest::blocking::Client {
        const LIBRARY: Library = Library::ReqwestBlocking;
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn execute_blocking(
        client: &reqwest::blocking::Client,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, HttpError> {
        httpwatch_debug!(name: "ReqwestBlockingClient.Send");
        let request = request.try_into()?;
        let mut response = client.execute(request)?;
        let headers = std::mem::take(response.headers_mut());
        let mut http_response = Response::builder()
            .status(response.status())
            .body(response.bytes()?)?;
        *http_response.headers_mut() = headers;

        Ok(http_response)
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[async_trait]
    impl HttpClient for reqwest::blocking::Client {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            execute_blocking(self, request)
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    impl InstrumentedClient<reqwest::blocking::Client> {
        /// Sends `request` on the calling thread, through the hook.
        pub fn execute(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            let Some(interceptor) = self.interceptor() else {
                return execute_blocking(&self.inner, request);
            };
            let summary = summarize_request(&request);
            interceptor.intercept(
                summary,
                || execute_blocking(&self.inner, request),
                summarize_response,
            )
        }
    }
}

#[cfg(feature = "hyper")]
pub mod hyper {
    //! A hyper-util based [`HttpClient`](super::HttpClient).
    use super::{async_trait, Bytes, HttpClient, HttpError, Request, Response, TargetLibrary};
    use http::HeaderValue;
    use http_body_util::{BodyExt, Full};
    use httpwatch::{httpwatch_debug, Library};
    use hyper::body::{Body as HttpBody, Frame};
    use hyper_util::client::legacy::{
        connect::{Connect, HttpConnector},
        Client,
    };
    use std::fmt::Debug;
    use std::pin::Pin;
    use std::task::{self, Poll};
    use std::time::Duration;
    use tokio::time;

    /// An [`HttpClient`] built on the hyper-util legacy client.
    #[derive(Debug, Clone)]
    pub struct HyperClient<C = HttpConnector>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        inner: Client<C, Body>,
        timeout: Duration,
        authorization: Option<HeaderValue>,
    }

    impl<C> HyperClient<C>
    where
        C: Connect + Clone + Send + Sync + 'static,
    {
        /// Creates a client using `connector`, failing requests that take
        /// longer than `timeout`.
        pub fn new(connector: C, timeout: Duration, authorization: Option<HeaderValue>) -> Self {
            let inner = Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);
            Self {
                inner,
                timeout,
                authorization,
            }
        }
    }

    impl HyperClient<HttpConnector> {
        /// Creates a new `HyperClient` with a default `HttpConnector`.
        pub fn with_default_connector(
            timeout: Duration,
            authorization: Option<HeaderValue>,
        ) -> Self {
            Self::new(HttpConnector::new(), timeout, authorization)
        }
    }

    impl TargetLibrary for HyperClient {
        const LIBRARY: Library = Library::Hyper;
    }

    #[async_trait]
    impl HttpClient for HyperClient {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            httpwatch_debug!(name: "HyperClient.Send");
            let (parts, body) = request.into_parts();
            let mut request = Request::from_parts(parts, Body::new(body));
            if let Some(ref authorization) = self.authorization {
                request
                    .headers_mut()
                    .insert(http::header::AUTHORIZATION, authorization.clone());
            }
            let mut response = time::timeout(self.timeout, self.inner.request(request)).await??;
            let headers = std::mem::take(response.headers_mut());

            let mut http_response = Response::builder()
                .status(response.status())
                .body(response.into_body().collect().await?.to_bytes())?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }

    pin_project_lite::pin_project! {
        /// Request body sent by [`HyperClient`].
        #[derive(Debug)]
        pub struct Body {
            #[pin]
            inner: Full<Bytes>,
        }
    }

    impl Body {
        fn new(bytes: Bytes) -> Self {
            Body {
                inner: Full::new(bytes),
            }
        }
    }

    impl HttpBody for Body {
        type Data = Bytes;
        type Error = HttpError;

        #[inline]
        fn poll_frame(
            self: Pin<&mut Self>,
            cx: &mut task::Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            self.project().inner.poll_frame(cx).map_err(Into::into)
        }

        #[inline]
        fn is_end_stream(&self) -> bool {
            self.inner.is_end_stream()
        }

        #[inline]
        fn size_hint(&self) -> hyper::body::SizeHint {
            self.inner.size_hint()
        }
    }
}

/// Methods to make working with responses from the [`HttpClient`] trait easier.
pub trait ResponseExt: Sized {
    /// Turn a response into an error if the HTTP status does not indicate success (200 - 299).
    fn error_for_status(self) -> Result<Self, HttpError>;
}

impl<T> ResponseExt for Response<T> {
    fn error_for_status(self) -> Result<Self, HttpError> {
        if self.status().is_success() {
            Ok(self)
        } else {
            Err(format!("request failed with status {}", self.status()).into())
        }
    }
}
