//! Actix-Web capture middleware
//!
//! Wraps an application (or a scope) and reports every failure it sees:
//! errors returned by the inner service, handler errors already turned into
//! responses, panics, and [`ReportedException`]s left in the request
//! extensions by upstream layers. The outcome the client sees is never
//! changed: errors are returned as is and panics keep unwinding.
//!
//! Reports carry the request environment as it stands when the request is
//! done, including [`RequestContext`](crate::environment::RequestContext)
//! entries added by the layers and handlers the middleware wraps.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::{ok, LocalBoxFuture, Ready};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;

use crate::config::Config;
use crate::environment::{Environment, LiveEnvironment, ReportedException};
use crate::error::ReportError;
use crate::event::{install_panic_hook, ExceptionEvent};
use crate::reporter::Reporter;

/// Exception reporting middleware for Actix-Web
///
/// ```rust,no_run
/// use actix_web::App;
/// use graylog_exceptions::{Config, ExceptionNotifier};
///
/// let notifier = ExceptionNotifier::new(Config::new("graylog.internal", 12201));
/// App::new().wrap(notifier);
/// ```
///
/// Handlers can take the [`Reporter`] as an extractor (or through
/// `web::ReqData<Reporter>`). Creating the middleware chains a panic hook so
/// panics are traced from where they happened.
#[derive(Debug, Clone)]
pub struct ExceptionNotifier {
    reporter: Reporter,
}

impl ExceptionNotifier {
    pub fn new(config: Config) -> Self {
        Self::with_reporter(Reporter::new(config))
    }

    pub fn with_reporter(reporter: Reporter) -> Self {
        install_panic_hook();
        Self { reporter }
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }
}

impl Default for ExceptionNotifier {
    fn default() -> Self {
        Self::new(Config::from_env())
    }
}

impl<S, B> Transform<S, ServiceRequest> for ExceptionNotifier
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = ExceptionNotifierService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(ExceptionNotifierService {
            service,
            reporter: self.reporter.clone(),
        })
    }
}

pub struct ExceptionNotifierService<S> {
    service: S,
    reporter: Reporter,
}

impl<S, B> Service<ServiceRequest> for ExceptionNotifierService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        req.extensions_mut().insert(self.reporter.clone());

        // one live environment per call; inner layers may add to it
        let live = LiveEnvironment::new(Environment::from_request(&req));
        let reporter = self.reporter.clone();
        let fut = live.clone().sync_scope(|| self.service.call(req));
        let scoped = live.clone();

        Box::pin(async move {
            let outcome = scoped.scope(AssertUnwindSafe(fut).catch_unwind()).await;

            match outcome {
                Ok(Ok(res)) => {
                    live.merge_request_context(res.request());
                    let env = live.snapshot();
                    if let Some(err) = res.response().error() {
                        notify(&reporter, &ExceptionEvent::from_actix(err), &env);
                    }
                    let reported = res.request().extensions().get::<ReportedException>().cloned();
                    if let Some(ReportedException(event)) = reported {
                        notify(&reporter, &event, &env);
                    }
                    Ok(res)
                }
                Ok(Err(err)) => {
                    notify(&reporter, &ExceptionEvent::from_actix(&err), &live.snapshot());
                    Err(err)
                }
                Err(panic) => {
                    notify(&reporter, &ExceptionEvent::from_panic(&*panic), &live.snapshot());
                    std::panic::resume_unwind(panic)
                }
            }
        })
    }
}

/// Report `event`; failures stay on the side channel
fn notify(reporter: &Reporter, event: &ExceptionEvent, env: &Environment) {
    if reporter.config().raise_on_report {
        tracing::debug!(
            category = %event.category,
            message = %event.message,
            "test mode, exception not delivered"
        );
        return;
    }

    if let Err(e) = reporter.capture(event, env) {
        let e = ReportError::capture(format!("could not report {}", event.category), Some(Box::new(e)));
        tracing::error!(kind = e.kind(), error = %e, "exception capture failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::TraceCleaner;
    use crate::delivery::testing::{FailingNotifier, RecordingNotifier};
    use crate::delivery::{DeliveryChannel, Notifier};
    use crate::environment::RequestContext;
    use actix_web::{error, http::StatusCode, test, web, App, HttpRequest, HttpResponse};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn reporter_with<N: Notifier>(config: Config, notifier: N) -> Reporter {
        let channel = DeliveryChannel::start(notifier, 64).unwrap();
        Reporter::with_parts(config, TraceCleaner::new(), channel)
    }

    fn recording() -> (Reporter, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        (reporter_with(Config::default(), notifier.clone()), notifier)
    }

    async fn bad_input() -> Result<HttpResponse, Error> {
        Err(error::ErrorBadRequest("bad input"))
    }

    async fn ledger_panic() -> HttpResponse {
        if true {
            panic!("ledger out of balance");
        }
        HttpResponse::Ok().finish()
    }

    fn first_backtrace_line(full_message: &str) -> Option<&str> {
        full_message.split(">> BACKTRACE <<\n").nth(1)?.lines().next()
    }

    #[actix_rt::test]
    async fn test_successful_request_passes_through() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/", web::get().to(|| async { HttpResponse::Ok().body("hello") })),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(test::read_body(res).await, web::Bytes::from_static(b"hello"));

        assert!(reporter.flush(WAIT));
        assert_eq!(reporter.stats().submitted, 0);
        assert!(notifier.records.lock().is_empty());
    }

    #[actix_rt::test]
    async fn test_handler_error_is_reported_and_kept() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/checkout", web::post().to(bad_input)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/checkout?step=2")
            .insert_header(("user-agent", "test-agent"))
            .insert_header(("authorization", "Bearer secret"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].short_message, "bad input");
        assert!(records[0].full_message.contains(" * REQUEST_URI: /checkout?step=2\n"));
        assert!(records[0].full_message.contains(" * HTTP_USER_AGENT: test-agent\n"));
        assert!(!records[0].full_message.contains("secret"));
        // traced from outside the middleware's own frames
        assert!(!records[0].full_message.contains("ExceptionNotifierService"));
        assert!(records[0]
            .file
            .as_deref()
            .map_or(true, |file| !file.ends_with("src/middleware.rs")));
    }

    #[actix_rt::test]
    async fn test_service_error_is_returned_unchanged() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap_fn(|req, srv| {
                    let fut = srv.call(req);
                    async move {
                        let _ = fut.await?;
                        Err::<ServiceResponse, _>(error::ErrorForbidden("denied by policy"))
                    }
                })
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let err = app
            .call(test::TestRequest::get().uri("/").to_request())
            .await
            .err()
            .unwrap();
        assert_eq!(err.as_response_error().status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "denied by policy");

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].short_message, "denied by policy");
    }

    #[actix_rt::test]
    async fn test_failing_notifier_does_not_change_outcome() {
        let reporter = reporter_with(Config::default(), FailingNotifier);
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/", web::get().to(bad_input)),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        assert!(reporter.flush(WAIT));
        assert_eq!(reporter.stats().failed, 1);
    }

    #[actix_rt::test]
    async fn test_panic_is_reported_and_resumed() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/", web::get().to(ledger_panic)),
        )
        .await;

        let outcome = AssertUnwindSafe(app.call(test::TestRequest::get().uri("/").to_request()))
            .catch_unwind()
            .await;
        let payload = outcome.err().unwrap();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"ledger out of balance"));

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].short_message, "ledger out of balance");
        assert!(records[0].full_message.contains(">> MAIN_ENV <<:"));
        let top = first_backtrace_line(&records[0].full_message).unwrap();
        assert!(top.contains("ledger_panic"), "top frame was {top}");
        assert!(records[0].line.is_some());
    }

    #[actix_rt::test]
    async fn test_reported_exception_extension() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route(
                    "/",
                    web::get().to(|req: HttpRequest| async move {
                        req.extensions_mut().insert(ReportedException(ExceptionEvent::new(
                            "Upstream::Timeout",
                            "recommendations unavailable",
                            vec!["./src/recommend.rs:30:in `shop::recommend::fetch'".to_string()],
                        )));
                        HttpResponse::Ok().finish()
                    }),
                ),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].short_message, "recommendations unavailable");
        assert_eq!(records[0].file.as_deref(), Some("./src/recommend.rs"));
    }

    #[actix_rt::test]
    async fn test_leveled_call_sees_request_environment() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                // registered last, so it runs before the notifier sees the request
                .wrap_fn(|req, srv| {
                    req.extensions_mut().insert(RequestContext::from_iter([
                        ("current_user", json!({ "id": 42 })),
                        ("locale", json!("en")),
                    ]));
                    srv.call(req)
                })
                .route(
                    "/orders",
                    web::get().to(|reporter: web::ReqData<Reporter>| async move {
                        reporter.warning("Orders", "low stock", None).unwrap();
                        HttpResponse::Ok().finish()
                    }),
                ),
        )
        .await;

        let req = test::TestRequest::get().uri("/orders").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        let full = &records[0].full_message;
        assert!(full.contains(" * REQUEST_URI: /orders\n"));
        assert!(full.contains(" * message: low stock\n"));
        assert!(full.contains(" * current_user: 42\n"));
        assert!(full.contains(" * locale: en\n"));
    }

    #[actix_rt::test]
    async fn test_context_from_inner_layer_reaches_error_report() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                // registered first, so it runs inside the notifier, like an auth layer
                .wrap_fn(|req, srv| {
                    req.extensions_mut()
                        .insert(RequestContext::from_iter([("current_user", json!({ "id": 42 }))]));
                    srv.call(req)
                })
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/checkout", web::post().to(bad_input)),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::post().uri("/checkout").to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].full_message.contains(" * current_user: 42\n"));
    }

    #[actix_rt::test]
    async fn test_attached_context_reaches_service_error_report() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap_fn(|req, srv| {
                    RequestContext::from_iter([("current_user", json!({ "id": 42 }))]).attach(&req);
                    let fut = srv.call(req);
                    async move {
                        let _ = fut.await?;
                        Err::<ServiceResponse, _>(error::ErrorForbidden("account locked"))
                    }
                })
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let err = app.call(test::TestRequest::get().uri("/").to_request()).await.err().unwrap();
        assert_eq!(err.to_string(), "account locked");

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].full_message.contains(" * current_user: 42\n"));
    }

    #[actix_rt::test]
    async fn test_reporter_extractor_sees_inner_context() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap_fn(|req, srv| {
                    req.extensions_mut()
                        .insert(RequestContext::from_iter([("current_user", json!({ "id": 42 }))]));
                    srv.call(req)
                })
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route(
                    "/orders",
                    web::get().to(|reporter: Reporter| async move {
                        reporter.warning("Orders", "low stock", None).unwrap();
                        HttpResponse::Ok().finish()
                    }),
                ),
        )
        .await;

        let req = test::TestRequest::get().uri("/orders").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 1);
        assert!(records[0].full_message.contains(" * current_user: 42\n"));
        assert!(records[0].full_message.contains(" * message: low stock\n"));
    }

    #[actix_rt::test]
    async fn test_concurrent_requests_keep_their_own_environment() {
        let (reporter, notifier) = recording();
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route(
                    "/{name}",
                    web::get().to(|reporter: web::ReqData<Reporter>, name: web::Path<String>| async move {
                        actix_rt::time::sleep(Duration::from_millis(10)).await;
                        reporter.info("Requests", &format!("served {name}"), None).unwrap();
                        HttpResponse::Ok().finish()
                    }),
                ),
        )
        .await;

        let (a, b) = futures::join!(
            test::call_service(&app, test::TestRequest::get().uri("/alpha").to_request()),
            test::call_service(&app, test::TestRequest::get().uri("/beta").to_request()),
        );
        assert!(a.status().is_success() && b.status().is_success());

        assert!(reporter.flush(WAIT));
        let records = notifier.records.lock();
        assert_eq!(records.len(), 2);
        for record in records.iter() {
            let name = record.short_message.trim_start_matches("served ");
            assert!(record.full_message.contains(&format!(" * REQUEST_URI: /{name}\n")));
            assert!(record.full_message.contains(&format!(" * message: served {name}\n")));
        }
    }

    #[actix_rt::test]
    async fn test_test_mode_only_logs() {
        let notifier = RecordingNotifier::default();
        let reporter = reporter_with(Config::default().with_raise_on_report(true), notifier.clone());
        let app = test::init_service(
            App::new()
                .wrap(ExceptionNotifier::with_reporter(reporter.clone()))
                .route("/", web::get().to(bad_input)),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(reporter.stats().submitted, 0);
        assert!(notifier.records.lock().is_empty());
    }
}
