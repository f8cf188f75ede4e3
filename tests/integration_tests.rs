//! Integration tests for hotmod
//!
//! End-to-end scenarios across the pipeline: file on disk → transform →
//! graph → plan → protocol messages → client runtime. Connection tasks are
//! simulated by registering clients directly and draining their outbound
//! queues, which is exactly what the WebSocket pump does.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use common::{drain, id, CountingTransformer, TestProject};
use hotmod::client::{ClientRuntime, Exports, ModuleFetcher};
use hotmod::graph::ModuleId;
use hotmod::server::registry::ClientId;
use hotmod::server::{ServerMessage, ServerShared};
use hotmod::{EsmTransformer, HmrServer, UpdateOutcome};

fn shared_for(project: &TestProject) -> Arc<ServerShared> {
    ServerShared::new(project.options(0), Box::new(EsmTransformer::new()))
}

/// Register a client and its loaded modules, as the connection task does
/// when `module-loaded` frames arrive.
fn connect_client(
    shared: &Arc<ServerShared>,
    modules: &[&str],
) -> (ClientId, UnboundedReceiver<ServerMessage>) {
    let (client, rx) = shared.registry.register();
    for module in modules {
        if shared.registry.mark_loaded(&client, id(module)) {
            shared.graph.lock().mark_loaded(&id(module));
        }
    }
    (client, rx)
}

async fn process_all(shared: &Arc<ServerShared>, files: &[&str]) {
    for file in files {
        shared.process_file(&id(file)).await.expect("pipeline ok");
    }
}

fn updates_in(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Update { file, .. } => Some(file.clone()),
            _ => None,
        })
        .collect()
}

fn full_reloads_in(messages: &[ServerMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, ServerMessage::FullReload { .. }))
        .count()
}

// ============================================================================
// Scenario: leaf edit, single accepting importer
// ============================================================================

#[tokio::test]
async fn leaf_edit_with_accepting_importer_pushes_ordered_chain() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\n");
    project.write("b.js", "import { a } from './a.js'\nexport const b = a + 1\n");
    project.write(
        "c.js",
        "import { b } from './b.js'\nif (import.meta.hot) {\nimport.meta.hot.accept()\n}\n",
    );

    let shared = shared_for(&project);
    process_all(&shared, &["a.js", "b.js", "c.js"]).await;

    let (_client, mut rx) = connect_client(&shared, &["a.js", "b.js", "c.js"]);

    project.write("a.js", "export const a = 2\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(updates_in(&messages), vec!["a.js", "b.js", "c.js"]);
    assert_eq!(full_reloads_in(&messages), 0);
}

#[tokio::test]
async fn client_only_receives_updates_for_its_loaded_modules() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\n");
    project.write(
        "b.js",
        "import { a } from './a.js'\nimport.meta.hot.accept()\n",
    );

    let shared = shared_for(&project);
    process_all(&shared, &["a.js", "b.js"]).await;

    let (_full, mut full_rx) = connect_client(&shared, &["a.js", "b.js"]);
    let (_partial, mut partial_rx) = connect_client(&shared, &["b.js"]);

    project.write("a.js", "export const a = 2\n");
    shared.process_file(&id("a.js")).await.unwrap();

    assert_eq!(updates_in(&drain(&mut full_rx)), vec!["a.js", "b.js"]);
    assert_eq!(updates_in(&drain(&mut partial_rx)), vec!["b.js"]);
}

// ============================================================================
// Scenario: edit under a decline
// ============================================================================

#[tokio::test]
async fn decline_forces_single_full_reload() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\n");
    project.write(
        "b.js",
        "import { a } from './a.js'\nimport.meta.hot.decline()\n",
    );
    project.write(
        "c.js",
        "import { a } from './b.js'\nimport.meta.hot.accept()\n",
    );

    let shared = shared_for(&project);
    process_all(&shared, &["a.js", "b.js", "c.js"]).await;

    let (_client, mut rx) = connect_client(&shared, &["a.js", "b.js", "c.js"]);
    let (_outsider, mut outsider_rx) = connect_client(&shared, &[]);

    project.write("a.js", "export const a = 2\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(full_reloads_in(&messages), 1);
    assert!(updates_in(&messages).is_empty());

    // A client that loaded nothing in the chain is left alone
    assert!(drain(&mut outsider_rx).is_empty());
}

// ============================================================================
// Scenario: cycle
// ============================================================================

#[tokio::test]
async fn cyclic_imports_update_once_and_report_the_cycle() {
    let project = TestProject::new();
    project.write("a.js", "import './b.js'\nimport.meta.hot.accept()\n");
    project.write("b.js", "import './a.js'\nimport.meta.hot.accept()\n");

    let shared = shared_for(&project);
    process_all(&shared, &["a.js", "b.js"]).await;

    let graph = shared.graph.lock();
    let chain = graph.get_update_chain(&id("a.js"));
    assert_eq!(chain.len(), 2);
    assert!(chain.contains(&id("a.js")));
    assert!(chain.contains(&id("b.js")));

    assert_eq!(
        graph.circular_dependencies(),
        vec![vec![id("a.js"), id("b.js")]]
    );
}

// ============================================================================
// Scenario: debounce burst
// ============================================================================

#[tokio::test]
async fn burst_of_changes_transforms_once_and_resolves_together() {
    let project = TestProject::new();
    project.write("x.js", "export const x = 1\nimport.meta.hot.accept()\n");

    let (transformer, calls) = CountingTransformer::new();
    let server = HmrServer::new(project.options(0), Box::new(transformer)).unwrap();

    let mut handles: Vec<_> = (0..20).map(|_| server.notify_change(id("x.js"))).collect();
    for handle in &mut handles {
        assert_eq!(handle.wait().await, UpdateOutcome::Applied);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Scenario: prune
// ============================================================================

#[tokio::test]
async fn removing_an_import_prunes_the_orphan() {
    let project = TestProject::new();
    project.write("root.js", "import './a.js'\nimport.meta.hot.accept()\n");
    project.write("a.js", "import './b.js'\nexport const a = 1\n");
    project.write("b.js", "export const b = 1\n");

    let shared = shared_for(&project);
    shared.graph.lock().set_entry(id("root.js"));
    process_all(&shared, &["root.js", "a.js", "b.js"]).await;

    // No client has loaded b.js
    let (_client, mut rx) = connect_client(&shared, &["root.js", "a.js"]);

    project.write("a.js", "export const a = 2\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(updates_in(&messages), vec!["a.js", "root.js"]);
    assert!(messages.contains(&ServerMessage::Prune {
        paths: vec!["b.js".to_string()]
    }));
    assert!(shared.graph.lock().get_module(&id("b.js")).is_none());
}

// ============================================================================
// Scenario: transform error, then fix
// ============================================================================

#[tokio::test]
async fn transform_error_surfaces_then_fix_restores_updates() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\n");
    project.write(
        "b.js",
        "import { a } from './a.js'\nimport.meta.hot.accept()\n",
    );

    let shared = shared_for(&project);
    process_all(&shared, &["a.js", "b.js"]).await;

    let (_client, mut rx) = connect_client(&shared, &["a.js", "b.js"]);

    // Break the syntax
    project.write("a.js", "import { broken } from\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ServerMessage::Error { file, error, .. } => {
            assert_eq!(file, "a.js");
            assert!(error.contains("a.js"));
        }
        other => panic!("expected error message, got {other:?}"),
    }

    // Graph state was retained
    {
        let graph = shared.graph.lock();
        let node = graph.get_module(&id("a.js")).unwrap();
        assert!(node.error.is_some());
        assert!(node.importers.contains(&id("b.js")));
        assert_eq!(node.transformed_code.as_deref(), Some("export const a = 1\n"));
    }

    // Fix the syntax: normal updates flow again
    project.write("a.js", "export const a = 3\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let messages = drain(&mut rx);
    assert_eq!(updates_in(&messages), vec!["a.js", "b.js"]);
    let graph = shared.graph.lock();
    assert!(graph.get_module(&id("a.js")).unwrap().error.is_none());
    assert!(graph
        .get_module(&id("a.js"))
        .unwrap()
        .importers
        .contains(&id("b.js")));
}

// ============================================================================
// Ordering and registration semantics
// ============================================================================

#[tokio::test]
async fn client_joining_mid_stream_gets_no_backfill() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\nimport.meta.hot.accept()\n");

    let shared = shared_for(&project);
    process_all(&shared, &["a.js"]).await;

    let (_early, mut early_rx) = connect_client(&shared, &["a.js"]);

    project.write("a.js", "export const a = 2\nimport.meta.hot.accept()\n");
    shared.process_file(&id("a.js")).await.unwrap();

    // Late client registers after the change was pushed
    let (_late, mut late_rx) = connect_client(&shared, &["a.js"]);

    assert_eq!(updates_in(&drain(&mut early_rx)), vec!["a.js"]);
    assert!(drain(&mut late_rx).is_empty());
}

#[tokio::test]
async fn unchanged_content_sends_nothing() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\nimport.meta.hot.accept()\n");

    let shared = shared_for(&project);
    process_all(&shared, &["a.js"]).await;

    let (_client, mut rx) = connect_client(&shared, &["a.js"]);

    // Touch the file without changing its content
    shared.process_file(&id("a.js")).await.unwrap();
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn graph_invariants_hold_across_pipeline_sequences() {
    let project = TestProject::new();
    project.write("main.js", "import './ui.js'\nimport './state.js'\n");
    project.write("ui.js", "import './state.js'\nexport const ui = 1\n");
    project.write("state.js", "export const state = {}\n");

    let shared = shared_for(&project);
    process_all(&shared, &["main.js", "ui.js", "state.js"]).await;
    shared.graph.lock().check_invariants().unwrap();

    // Rewire: ui stops importing state, main drops ui
    project.write("ui.js", "export const ui = 2\n");
    shared.process_file(&id("ui.js")).await.unwrap();
    shared.graph.lock().check_invariants().unwrap();

    project.write("main.js", "import './state.js'\n");
    shared.process_file(&id("main.js")).await.unwrap();

    let graph = shared.graph.lock();
    graph.check_invariants().unwrap();
    assert!(graph.get_module(&id("ui.js")).is_none());
    assert!(graph.get_module(&id("state.js")).is_some());
}

// ============================================================================
// Server messages driving the client runtime
// ============================================================================

/// Fetcher double serving canned namespaces per file.
struct CannedFetcher {
    responses: BTreeMap<ModuleId, Exports>,
}

impl ModuleFetcher for CannedFetcher {
    fn fetch(&mut self, file: &ModuleId, _cache_bust: u64) -> Result<Exports, String> {
        self.responses
            .get(file)
            .cloned()
            .ok_or_else(|| format!("404 for {file}"))
    }
}

fn namespace(pairs: &[(&str, Value)]) -> Exports {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.clone());
    }
    map
}

#[tokio::test]
async fn pushed_updates_hot_swap_the_client_runtime() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\n");
    project.write(
        "b.js",
        "import { a } from './a.js'\nimport.meta.hot.accept()\n",
    );

    let shared = shared_for(&project);
    process_all(&shared, &["a.js", "b.js"]).await;
    let (_client, mut rx) = connect_client(&shared, &["a.js", "b.js"]);

    project.write("a.js", "export const a = 2\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let fetcher = CannedFetcher {
        responses: [
            (id("a.js"), namespace(&[("a", json!(2))])),
            (id("b.js"), namespace(&[("b", json!(3))])),
        ]
        .into_iter()
        .collect(),
    };
    let mut runtime = ClientRuntime::new(fetcher);
    runtime.register_module(id("a.js"), namespace(&[("a", json!(1))]));
    runtime.register_module(id("b.js"), namespace(&[("b", json!(2))]));

    for message in drain(&mut rx) {
        runtime.handle_message(message);
    }

    assert_eq!(runtime.exports(&id("a.js")).unwrap()["a"], json!(2));
    assert_eq!(runtime.exports(&id("b.js")).unwrap()["b"], json!(3));
    assert!(!runtime.reload_requested());
}

#[tokio::test]
async fn pushed_full_reload_reaches_the_client_runtime() {
    let project = TestProject::new();
    project.write("a.js", "export const a = 1\n");
    project.write("top.js", "import { a } from './a.js'\n");

    let shared = shared_for(&project);
    process_all(&shared, &["a.js", "top.js"]).await;
    let (_client, mut rx) = connect_client(&shared, &["a.js", "top.js"]);

    // Nothing in the chain accepts: the server demands a reload
    project.write("a.js", "export const a = 2\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let mut runtime = ClientRuntime::new(CannedFetcher {
        responses: BTreeMap::new(),
    });
    runtime.register_module(id("a.js"), namespace(&[]));
    runtime.register_module(id("top.js"), namespace(&[]));

    for message in drain(&mut rx) {
        runtime.handle_message(message);
    }
    assert!(runtime.reload_requested());
}

#[tokio::test]
async fn prune_messages_drop_client_records() {
    let project = TestProject::new();
    project.write("root.js", "import './a.js'\nimport.meta.hot.accept()\n");
    project.write("a.js", "import './b.js'\n");
    project.write("b.js", "export const b = 1\n");

    let shared = shared_for(&project);
    shared.graph.lock().set_entry(id("root.js"));
    process_all(&shared, &["root.js", "a.js", "b.js"]).await;
    let (_client, mut rx) = connect_client(&shared, &["root.js", "a.js"]);

    project.write("a.js", "export const a = 1\n");
    shared.process_file(&id("a.js")).await.unwrap();

    let mut runtime = ClientRuntime::new(CannedFetcher {
        responses: [
            (id("root.js"), namespace(&[])),
            (id("a.js"), namespace(&[])),
        ]
        .into_iter()
        .collect(),
    });
    runtime.register_module(id("root.js"), namespace(&[]));
    runtime.register_module(id("a.js"), namespace(&[]));
    runtime.register_module(id("b.js"), namespace(&[]));

    for message in drain(&mut rx) {
        runtime.handle_message(message);
    }
    assert!(runtime.exports(&id("b.js")).is_none());
    assert_eq!(runtime.loaded_files(), vec![id("a.js"), id("root.js")]);
}
