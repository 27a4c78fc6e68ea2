//! Collab demo: two clients editing one document through a single manager.
//!
//! Everything runs in-process over a `LocalBus`. Set `RUST_LOG=debug` to see
//! the per-request flow inside the manager.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use collab_core::{
    ClientCommunication, ClientConfig, CollabError, CollabResponse, CollabServer, InMemoryStorage,
    LocalBus, ManagerConfig, MessageBus, PlainText, TextStep,
};

const DOC: &str = "welcome";

/// Logs a protocol failure and turns it into `None`.
fn accepted<T>(what: &str, response: CollabResponse<T>) -> Option<T> {
    match response {
        Ok(value) => Some(value),
        Err(kind) => {
            warn!("{what} refused: {kind}");
            None
        }
    }
}

fn client(
    bus: &Arc<dyn MessageBus>,
    client_id: &str,
    user_id: &str,
    manager_id: &str,
) -> collab_core::Result<ClientCommunication<PlainText>> {
    let config = ClientConfig {
        client_id: client_id.to_string(),
        user_id: user_id.to_string(),
        manager_id: manager_id.to_string(),
        request_timeout: Duration::from_secs(2),
    };
    ClientCommunication::new(config, bus.clone())
}

#[tokio::main]
async fn main() -> Result<(), CollabError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::default());
    let storage = Arc::new(InMemoryStorage::<PlainText>::new().with_document(DOC, "hello world!".to_string()));
    let server = CollabServer::new(ManagerConfig::default(), PlainText, storage, bus.clone())?;
    server.start();

    let alice = client(&bus, "client-1", "alice", server.manager_id())?;
    let bob = client(&bus, "client-2", "bob", server.manager_id())?;
    let cancel = CancellationToken::new();

    let _watch = bob.watch(DOC, |note| {
        info!("bob sees {} at version {}", note.doc_name, note.version);
    });

    if let Some(doc) = accepted("alice GetDocument", alice.get_document(DOC, &cancel).await?) {
        info!("alice opened {DOC:?} at version {}: {:?}", doc.version, doc.doc);
    }
    let Some(start) = accepted("bob GetDocument", bob.get_document(DOC, &cancel).await?) else {
        return Ok(());
    };

    // Alice wins the race for version 0.
    accepted(
        "alice PushEvents",
        alice
            .push_events(DOC, 0, vec![TextStep::insert(0, "lovely ")], &cancel)
            .await?,
    );

    // Bob is now stale: pull, rebase, resubmit.
    let mut version = start.version as i64;
    // Inserting at 0 commutes with anything bob might have missed.
    let steps = vec![TextStep::insert(0, "very ")];
    loop {
        match bob.push_events(DOC, version, steps.clone(), &cancel).await? {
            Ok(_) => {
                info!("bob's push accepted on top of version {version}");
                break;
            }
            Err(kind) => {
                warn!("bob's push at version {version} refused: {kind}");
                let Some(missed) = accepted("bob PullEvents", bob.pull_events(DOC, version, &cancel).await?)
                else {
                    return Ok(());
                };
                info!(
                    "bob pulled {} step(s) from {:?}",
                    missed.steps.len(),
                    missed.client_ids
                );
                version = missed.version as i64;
            }
        }
    }

    if let Some(history) = accepted("alice PullEvents", alice.pull_events(DOC, 0, &cancel).await?) {
        for (step, client_id) in history.steps.iter().zip(&history.client_ids) {
            info!("  {client_id}: {step:?}");
        }
        info!("history ends at version {}", history.version);
    }
    if let Some(doc) = accepted("alice GetDocument", alice.get_document(DOC, &cancel).await?) {
        info!("final document: {:?} ({} users)", doc.doc, doc.users);
    }

    // Let the last NewVersion reach bob's watch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown().await;
    Ok(())
}
