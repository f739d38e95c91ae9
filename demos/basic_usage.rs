//! Reporting exceptions from an Actix-Web app to Graylog
//!
//! Start a GELF UDP input on localhost:12201 (or point `GRAYLOG_HOST` and
//! `GRAYLOG_PORT` elsewhere), then:
//! ```bash
//! RUST_LOG=graylog_exceptions=debug cargo run --example basic_usage
//! ```

use actix_web::{error, web, App, HttpResponse, HttpServer};
use graylog_exceptions::{Config, ExceptionNotifier, Reporter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn index() -> HttpResponse {
    HttpResponse::Ok().body("Hello Graylog!")
}

/// Handler errors are reported and still reach the client as 400
async fn checkout(body: String) -> actix_web::Result<HttpResponse> {
    if body.trim().is_empty() {
        return Err(error::ErrorBadRequest("empty basket"));
    }
    Ok(HttpResponse::Ok().body("order placed"))
}

/// Leveled reports carry the request environment
async fn restock(reporter: Reporter) -> HttpResponse {
    let err = anyhow::anyhow!("warehouse API returned 503");
    let _ = reporter.warning("Inventory", "restock skipped", Some(&err));
    HttpResponse::Accepted().finish()
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graylog_exceptions=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().with_facility("demo-shop");
    let notifier = ExceptionNotifier::new(config);
    let reporter = notifier.reporter().clone();

    tracing::info!("demo listening on http://127.0.0.1:8080");

    HttpServer::new(move || {
        App::new()
            .wrap(notifier.clone())
            .service(web::resource("/").route(web::get().to(index)))
            .service(web::resource("/checkout").route(web::post().to(checkout)))
            .service(web::resource("/restock").route(web::post().to(restock)))
    })
    .bind("127.0.0.1:8080")?
    .run()
    .await?;

    reporter.shutdown();
    tracing::info!(stats = ?reporter.stats(), "reporter drained");
    Ok(())
}
