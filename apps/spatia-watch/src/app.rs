use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use spatia_sync::{
    ConflictChange, ConflictSink, ConnectionState, EventJournal, EventSink, GeometryUpdate,
    Method, PendingCall, RequestQueue, RequestSpec, Scene, StreamEvent, SyncClient, SyncConfig,
};
use tracing::info;

use crate::cli::{CheckArgs, Cli, Command, GeometryArgs, RequestArgs, WatchArgs};
use crate::error::CliError;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let base_url = cli.base_url.as_deref();
    match cli.command {
        Some(Command::Check(args)) => check(args),
        Some(Command::Geometry(args)) => geometry(load_config(base_url)?, args).await,
        Some(Command::Request(args)) => request(load_config(base_url)?, args).await,
        Some(Command::Watch(args)) => watch(load_config(base_url)?, args).await,
        None => watch(load_config(base_url)?, WatchArgs::default()).await,
    }
}

fn load_config(base_url: Option<&str>) -> Result<SyncConfig, CliError> {
    let config = SyncConfig::from_env()?;
    match base_url {
        Some(url) => Ok(config.with_base_url(url).normalize()?),
        None => Ok(config),
    }
}

/// Prints stream activity and keeps it in a bounded journal.
struct ConsoleSink {
    journal: EventJournal,
}

impl EventSink for ConsoleSink {
    fn on_sync_required(&self) {
        println!("↻ resync required");
    }

    fn on_event(&self, event: &StreamEvent) {
        self.journal.record(event);
        println!(
            "• {} {}",
            event.kind.as_str(),
            Value::Object(event.payload.clone())
        );
    }
}

fn print_state(state: ConnectionState, workspace: Option<String>) {
    match state.banner() {
        Some(banner) => println!("⚠️  {banner}"),
        None => println!(
            "✅ {state} (workspace {})",
            workspace.as_deref().unwrap_or("unknown")
        ),
    }
}

async fn watch(config: SyncConfig, args: WatchArgs) -> Result<(), CliError> {
    let sink = Arc::new(ConsoleSink {
        journal: EventJournal::new(args.journal),
    });
    let mut client = SyncClient::new(config, sink.clone())?;
    if let Some(path) = &args.scene {
        let scene = load_scene(path)?.into_shared();
        let printer: Arc<dyn ConflictSink> = Arc::new(|changes: &[ConflictChange]| {
            for change in changes {
                println!(
                    "◼ {} conflict={} class='{}'",
                    change.node_id,
                    change.conflict,
                    change.class_name()
                );
            }
        });
        client = client.with_scene(scene, Some(printer));
    }

    let mut states = client.subscribe_state();
    client.start();
    print_state(client.state(), None);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                print_state(state, client.workspace());
            }
            _ = &mut shutdown => break,
        }
    }

    client.shutdown();
    info!(target: "spatia.supervisor", events = sink.journal.len(), "watch finished");
    println!("observed {} events", sink.journal.len());
    Ok(())
}

fn load_scene(path: &Path) -> Result<Scene, CliError> {
    let raw = std::fs::read_to_string(path)?;
    Scene::from_json(&raw).map_err(|source| CliError::Scene {
        path: path.to_path_buf(),
        source,
    })
}

fn conflicting_ids(mut scene: Scene) -> Vec<String> {
    scene.apply_conflicts();
    scene
        .conflicting()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn check(args: CheckArgs) -> Result<(), CliError> {
    let conflicting = conflicting_ids(load_scene(&args.scene)?);
    if args.json {
        println!("{}", serde_json::to_string(&conflicting)?);
    } else if conflicting.is_empty() {
        println!("no conflicts");
    } else {
        for id in conflicting {
            println!("{id}");
        }
    }
    Ok(())
}

fn parse_method(method: &str) -> Result<Method, CliError> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        _ => Err(CliError::InvalidMethod(method.to_string())),
    }
}

fn build_request(args: RequestArgs) -> Result<RequestSpec, CliError> {
    let spec = RequestSpec::new(parse_method(&args.method)?, args.path);
    match args.body {
        Some(body) => Ok(spec.with_body(serde_json::from_str(&body)?)),
        None => Ok(spec),
    }
}

/// Runs one queued call against a started client, then shuts it down.
async fn submit<F>(config: SyncConfig, call: F) -> Result<Value, CliError>
where
    F: FnOnce(&RequestQueue) -> PendingCall,
{
    let client = SyncClient::new(config, Arc::new(|| {}))?;
    client.start();
    let outcome = call(client.queue().as_ref()).await;
    client.shutdown();
    Ok(outcome?.body)
}

async fn request(config: SyncConfig, args: RequestArgs) -> Result<(), CliError> {
    let spec = build_request(args)?;
    let body = submit(config, |queue| queue.submit(spec)).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn geometry(config: SyncConfig, args: GeometryArgs) -> Result<(), CliError> {
    let updates = [GeometryUpdate {
        id: args.id.clone(),
        x: args.x,
        y: args.y,
    }];
    let body = submit(config, |queue| queue.post_geometry(&updates)).await?;
    println!("geometry synced for {}: {}", args.id, body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_are_case_insensitive() {
        assert_eq!(parse_method("patch").unwrap(), Method::PATCH);
        assert!(matches!(
            parse_method("TRACE"),
            Err(CliError::InvalidMethod(m)) if m == "TRACE"
        ));
    }

    #[test]
    fn request_bodies_must_be_json() {
        let args = RequestArgs {
            method: "post".into(),
            path: "/api/echo".into(),
            body: Some("{not json".into()),
        };
        assert!(matches!(build_request(args), Err(CliError::Json(_))));

        let args = RequestArgs {
            method: "post".into(),
            path: "/api/echo".into(),
            body: Some(r#"{"hello":"spatia"}"#.into()),
        };
        let spec = build_request(args).unwrap();
        assert_eq!(spec.body, Some(serde_json::json!({ "hello": "spatia" })));
    }

    #[test]
    fn reports_overlapping_nodes_of_a_scene() {
        let scene = Scene::from_json(
            r#"{
                "nodes": [
                    {"id": "a", "position": {"x": 100, "y": 150}, "size": {"w": 250, "h": 150}, "domain": "generic"},
                    {"id": "b", "position": {"x": 120, "y": 160}, "size": {"w": 250, "h": 150}, "domain": "generic"},
                    {"id": "c", "position": {"x": 900, "y": 150}, "size": {"w": 250, "h": 150}, "domain": "generic"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(conflicting_ids(scene), vec!["a", "b"]);
    }

    #[test]
    fn missing_scene_file_is_an_io_error() {
        let err = load_scene(Path::new("/nonexistent/scene.json")).unwrap_err();
        assert!(matches!(err, CliError::Io(_)));
    }
}
