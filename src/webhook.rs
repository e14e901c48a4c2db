//! External webhook ingress.
//!
//! `POST /hook/<hook_id>` feeds the dispatcher a webhook event whose
//! payload carries the hook id from the path plus the request body under
//! `body` (reachable in sub-actions as `${event:body.<field>}`). Requests
//! are acknowledged as soon as the event is matched; execution itself is
//! asynchronous.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use warp::Filter;

use crate::actions::{EventSource, PlatformEvent, TriggerDispatcher};

/// Start the webhook HTTP listener.
///
/// Returns a future that runs until cancelled.
pub async fn start_webhook_server(
    addr: SocketAddr,
    dispatcher: Arc<TriggerDispatcher>,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("[webhook] Listening for webhooks on {}", addr);

    let hook_route = warp::path!("hook" / String)
        .and(warp::post())
        .and(
            warp::body::json::<serde_json::Value>()
                .or(warp::any().map(|| json!({})))
                .unify(),
        )
        .and(warp::any().map(move || dispatcher.clone()))
        .then(
            |hook_id: String, body: serde_json::Value, dispatcher: Arc<TriggerDispatcher>| async move {
                let event = PlatformEvent::new(
                    EventSource::Webhook,
                    json!({ "hook_id": hook_id, "body": body }),
                );
                let submitted = dispatcher.handle_event(&event).await;
                warp::reply::with_status(
                    json!({ "submitted": submitted }).to_string(),
                    if submitted > 0 {
                        warp::http::StatusCode::ACCEPTED
                    } else {
                        warp::http::StatusCode::NOT_FOUND
                    },
                )
            },
        );

    warp::serve(hook_route).run(addr).await;

    Ok(())
}
