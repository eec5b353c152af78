use super::*;
use crate::db::MemoryStore;
use crate::db::memory::OpCounts;
use crate::services::document::SharedDocument;
use crate::services::persistence::{note_insert_key, note_update_key};
use crate::state::{Position, test_helpers};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn inbound(event: &str, data: serde_json::Value) -> String {
    serde_json::to_string(&Frame::event(event, data)).expect("frame should serialize")
}

async fn send(state: &AppState, connection_id: ConnectionId, event: &str, data: serde_json::Value) -> Vec<Frame> {
    process_inbound_text(state, connection_id, &inbound(event, data)).await
}

fn events(frames: &[Frame]) -> Vec<&str> {
    frames.iter().map(|f| f.event.as_str()).collect()
}

async fn past_debounce() {
    tokio::time::sleep(Duration::from_millis(2100)).await;
    tokio::task::yield_now().await;
}

async fn drawing_paths(state: &AppState) -> Vec<serde_json::Value> {
    state.board.read().await.document.drawing().paths.clone()
}

// =============================================================================
// connect / disconnect
// =============================================================================

#[tokio::test]
async fn connect_sends_handshake_to_self_and_presence_to_all() {
    let state = test_helpers::test_app_state();
    state.board.write().await.document.append_stroke(json!({"x": 1}));
    let (_peer, mut rx_peer) = test_helpers::connect_client(&state).await;

    let id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    let handshake = handle_connect(&state, id, tx).await;

    assert_eq!(events(&handshake), vec![EVENT_CONNECTED, EVENT_LOAD_DRAWING, EVENT_LOAD_STICKY_NOTES]);
    assert_eq!(handshake[0].data["connectionId"], json!(id));
    assert_eq!(handshake[1].data["paths"], json!([{"x": 1}]));
    assert_eq!(handshake[2].data, json!([]));

    let roster = test_helpers::recv_frame(&mut rx_peer).await;
    assert_eq!(roster.event, "users-update");
    assert_eq!(roster.data.as_array().map(Vec::len), Some(2));
    assert_eq!(test_helpers::recv_frame(&mut rx).await.event, "users-update");
}

#[tokio::test]
async fn disconnect_releases_turn_and_updates_roster() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (b, mut rx_b) = test_helpers::connect_client(&state).await;
    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;
    test_helpers::drain(&mut rx_b);

    handle_disconnect(&state, a).await;

    let roster = test_helpers::recv_frame(&mut rx_b).await;
    assert_eq!(roster.event, "users-update");
    assert_eq!(roster.data.as_array().map(Vec::len), Some(1));

    let replies = send(&state, b, EVENT_DRAW, json!({"x": 2})).await;
    assert!(replies.is_empty(), "draw after holder left should be granted");
    assert_eq!(state.board.read().await.turn.holder(), Some(b));
}

// =============================================================================
// malformed input
// =============================================================================

#[tokio::test]
async fn invalid_json_gets_error_reply_only() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    let replies = process_inbound_text(&state, a, "{not json").await;
    assert_eq!(events(&replies), vec!["error"]);
    assert!(replies[0].data["message"].as_str().is_some_and(|m| m.starts_with("invalid json")));
    test_helpers::assert_no_frame(&mut rx_b).await;
}

#[tokio::test]
async fn unknown_event_is_rejected_with_code() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    let replies = send(&state, a, "bogus", json!({})).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].data["message"], "unknown event: bogus");
    assert_eq!(replies[0].data["code"], "E_UNKNOWN_EVENT");
}

#[tokio::test]
async fn draw_without_path_is_rejected_and_takes_no_turn() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    let replies = send(&state, a, EVENT_DRAW, serde_json::Value::Null).await;
    assert_eq!(replies[0].data["code"], "E_MISSING_PATH");
    assert!(drawing_paths(&state).await.is_empty());
    assert_eq!(state.board.read().await.turn.holder(), None);
}

#[tokio::test]
async fn update_note_with_bad_field_type_is_rejected() {
    let state = test_helpers::test_app_state();
    state.board.write().await.document.upsert_note(test_helpers::note("n1", "hi"));
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    let replies = send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "n1", "text": 5})).await;
    assert_eq!(replies[0].data["code"], "E_INVALID_PAYLOAD");
    let board = state.board.read().await;
    assert_eq!(board.document.note("n1").and_then(|n| n.text.as_deref()), Some("hi"));
}

// =============================================================================
// drawing turn
// =============================================================================

#[tokio::test]
async fn strokes_from_holder_concatenate_in_order() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    let strokes: Vec<_> = (0..6).map(|i| json!({"i": i})).collect();
    for stroke in &strokes {
        assert!(send(&state, a, EVENT_DRAW, stroke.clone()).await.is_empty());
    }

    assert_eq!(drawing_paths(&state).await, strokes);
    let relayed: Vec<_> = test_helpers::drain(&mut rx_b)
        .into_iter()
        .filter(|f| f.event == EVENT_DRAW)
        .map(|f| f.data)
        .collect();
    assert_eq!(relayed, strokes);
}

#[tokio::test]
async fn second_drawer_is_denied_while_turn_held() {
    let state = test_helpers::test_app_state();
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (b, mut rx_b) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_DRAW, json!({"x": 1, "y": 1})).await;
    let seen_by_b = test_helpers::drain(&mut rx_b);
    assert_eq!(events(&seen_by_b), vec!["users-update", EVENT_DRAW]);
    assert_eq!(seen_by_b[0].data.as_array().map(|r| r.iter().filter(|c| c["isDrawing"] == true).count()), Some(1));
    test_helpers::drain(&mut rx_a);

    let replies = send(&state, b, EVENT_DRAW, json!({"x": 2, "y": 2})).await;

    assert_eq!(events(&replies), vec![EVENT_DRAWING_NOT_ALLOWED]);
    assert_eq!(replies[0].data["holder"], json!(a));
    assert_eq!(drawing_paths(&state).await, vec![json!({"x": 1, "y": 1})]);
    test_helpers::assert_no_frame(&mut rx_a).await;
}

#[tokio::test]
async fn draw_is_granted_after_holder_stops() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (b, _rx_b) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;
    send(&state, a, EVENT_ENSURE_DRAWING_STOPPED, serde_json::Value::Null).await;

    assert!(send(&state, b, EVENT_DRAW, json!({"x": 2})).await.is_empty());
    assert_eq!(drawing_paths(&state).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn draw_is_granted_after_holder_goes_idle() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (b, _rx_b) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;
    tokio::time::advance(Duration::from_millis(20_001)).await;
    let released = crate::services::turn::sweep_idle_turn(&state, tokio::time::Instant::now()).await;
    assert_eq!(released, Some(a));

    assert!(send(&state, b, EVENT_DRAW, json!({"x": 2})).await.is_empty());
    assert_eq!(state.board.read().await.turn.holder(), Some(b));
}

#[tokio::test]
async fn force_clear_only_changes_own_turn() {
    let state = test_helpers::test_app_state();
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (b, _rx_b) = test_helpers::connect_client(&state).await;
    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;
    test_helpers::drain(&mut rx_a);

    send(&state, b, EVENT_FORCE_CLEAR_DRAWING_STATE, serde_json::Value::Null).await;
    assert_eq!(state.board.read().await.turn.holder(), Some(a));
    test_helpers::assert_no_frame(&mut rx_a).await;

    send(&state, a, EVENT_FORCE_CLEAR_DRAWING_STATE, serde_json::Value::Null).await;
    assert_eq!(state.board.read().await.turn.holder(), None);
    assert_eq!(test_helpers::recv_frame(&mut rx_a).await.event, "users-update");
}

#[tokio::test]
async fn ensure_stopped_from_non_holder_still_broadcasts_roster() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (b, mut rx_b) = test_helpers::connect_client(&state).await;
    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;
    test_helpers::drain(&mut rx_b);

    send(&state, b, EVENT_ENSURE_DRAWING_STOPPED, serde_json::Value::Null).await;

    assert_eq!(test_helpers::recv_frame(&mut rx_b).await.event, "users-update");
    assert_eq!(state.board.read().await.turn.holder(), Some(a));
}

// =============================================================================
// drawing updates
// =============================================================================

#[tokio::test]
async fn stop_draw_adopts_client_paths_and_releases_turn() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;
    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;
    test_helpers::drain(&mut rx_b);

    send(&state, a, EVENT_STOP_DRAW, json!({"id": "ignored", "paths": [{"x": 1}, {"x": 2}]})).await;

    let seen = test_helpers::drain(&mut rx_b);
    assert_eq!(events(&seen), vec![EVENT_UPDATE_DRAWING, "users-update"]);
    assert_eq!(seen[0].data["id"], "main-drawing");
    assert_eq!(seen[0].data["paths"].as_array().map(Vec::len), Some(2));
    assert_eq!(state.board.read().await.turn.holder(), None);
    assert!(state.scheduler.is_pending("main-drawing"));
}

#[tokio::test]
async fn update_drawing_coerces_paths_and_relays_to_others() {
    let state = test_helpers::test_app_state();
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;
    state.board.write().await.document.append_stroke(json!({"old": true}));

    send(&state, a, EVENT_UPDATE_DRAWING, json!({"paths": "not a list"})).await;

    assert!(drawing_paths(&state).await.is_empty());
    let relayed = test_helpers::recv_frame(&mut rx_b).await;
    assert_eq!(relayed.event, EVENT_UPDATE_DRAWING);
    assert_eq!(relayed.data["source"], "server");
    assert_eq!(relayed.data["operation"], "update");
    assert_eq!(relayed.from.as_deref(), Some(a.to_string().as_str()));
    test_helpers::assert_no_frame(&mut rx_a).await;
}

#[tokio::test]
async fn update_drawing_replaces_paths() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_UPDATE_DRAWING, json!({"paths": [{"x": 7}], "operation": "draw"})).await;
    assert_eq!(drawing_paths(&state).await, vec![json!({"x": 7})]);
}

#[tokio::test]
async fn update_drawing_clear_goes_to_everyone_and_saves_now() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    state.board.write().await.document.append_stroke(json!({"x": 1}));

    send(&state, a, EVENT_UPDATE_DRAWING, json!({"paths": [{"x": 1}], "operation": "clear"})).await;

    let seen = test_helpers::drain(&mut rx_a);
    assert_eq!(events(&seen), vec![EVENT_UPDATE_DRAWING, EVENT_CLEAR_CANVAS]);
    assert_eq!(seen[0].data["operation"], "clear");
    assert!(drawing_paths(&state).await.is_empty());
    assert_eq!(store.records(crate::db::DRAWINGS)[0]["paths"], json!([]));
}

#[tokio::test(start_paused = true)]
async fn clear_canvas_then_reload_yields_empty_drawing() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;
    send(&state, a, EVENT_CLEAR_CANVAS, serde_json::Value::Null).await;

    assert_eq!(
        events(&test_helpers::drain(&mut rx_a)),
        vec!["users-update", EVENT_UPDATE_DRAWING, EVENT_CLEAR_CANVAS, "users-update"]
    );
    assert_eq!(
        events(&test_helpers::drain(&mut rx_b)),
        vec!["users-update", EVENT_DRAW, EVENT_UPDATE_DRAWING, EVENT_CLEAR_CANVAS, "users-update"]
    );
    assert_eq!(state.board.read().await.turn.holder(), None);

    let reloaded = SharedDocument::load_initial(store.as_ref()).await;
    assert_eq!(reloaded.drawing(), &Drawing::empty());

    past_debounce().await;
    let reloaded = SharedDocument::load_initial(store.as_ref()).await;
    assert_eq!(reloaded.drawing(), &Drawing::empty(), "stale stroke save must not land after clear");
}

#[tokio::test(start_paused = true)]
async fn clear_after_saved_update_drawing_reloads_without_source() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_UPDATE_DRAWING, json!({"paths": [{"x": 1}]})).await;
    past_debounce().await;
    assert_eq!(store.records(crate::db::DRAWINGS)[0]["source"], "server");

    send(&state, a, EVENT_CLEAR_CANVAS, serde_json::Value::Null).await;

    let reloaded = SharedDocument::load_initial(store.as_ref()).await;
    assert_eq!(reloaded.drawing(), &Drawing::empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_draw_and_clear_keep_peers_board_and_store_in_step() {
    let store = Arc::new(MemoryStore::new());
    let config = crate::config::SyncConfig { save_debounce: Duration::from_millis(20), ..Default::default() };
    let state = AppState::new(store.clone(), SharedDocument::default(), config);
    let (drawer, _rx_drawer) = test_helpers::connect_client(&state).await;
    let (clearer, _rx_clearer) = test_helpers::connect_client(&state).await;
    let (_watcher, mut rx_watcher) = test_helpers::connect_client(&state).await;

    let strokes = {
        let state = state.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                send(&state, drawer, EVENT_DRAW, json!({"i": i})).await;
                tokio::task::yield_now().await;
            }
        })
    };
    let clears = {
        let state = state.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                send(&state, clearer, EVENT_CLEAR_CANVAS, serde_json::Value::Null).await;
                tokio::task::yield_now().await;
            }
        })
    };
    strokes.await.expect("draw task should finish");
    clears.await.expect("clear task should finish");

    // Replay what a peer saw the way a client would.
    let mut replayed = Vec::new();
    for frame in test_helpers::drain(&mut rx_watcher) {
        match frame.event.as_str() {
            EVENT_DRAW => replayed.push(frame.data),
            EVENT_CLEAR_CANVAS => replayed.clear(),
            _ => {}
        }
    }
    let board_paths = drawing_paths(&state).await;
    assert_eq!(replayed, board_paths, "peer view diverged from the board");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stored = store.records(crate::db::DRAWINGS);
    assert_eq!(stored[0]["paths"], json!(board_paths), "store diverged from the board");
}

#[tokio::test]
async fn clear_canvas_from_non_holder_keeps_holder_turn() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (b, _rx_b) = test_helpers::connect_client(&state).await;
    send(&state, a, EVENT_DRAW, json!({"x": 1})).await;

    send(&state, b, EVENT_CLEAR_CANVAS, serde_json::Value::Null).await;

    assert!(drawing_paths(&state).await.is_empty());
    assert_eq!(state.board.read().await.turn.holder(), Some(a));
}

#[tokio::test]
async fn load_draw_replies_with_current_drawing() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    state.board.write().await.document.append_stroke(json!({"x": 3}));

    let replies = send(&state, a, EVENT_LOAD_DRAW, serde_json::Value::Null).await;
    assert_eq!(events(&replies), vec![EVENT_LOAD_DRAWING]);
    assert_eq!(replies[0].data["paths"], json!([{"x": 3}]));
}

// =============================================================================
// notes
// =============================================================================

#[tokio::test]
async fn add_then_delete_note_round_trips_cache() {
    let state = test_helpers::test_app_state();
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_ADD_NOTE, json!({"id": "n1", "text": "hi"})).await;
    {
        let board = state.board.read().await;
        assert_eq!(board.document.note_count(), 1);
        assert!(board.document.note("n1").is_some());
    }
    let added = test_helpers::recv_frame(&mut rx_b).await;
    assert_eq!(added.event, EVENT_NOTE_ADDED);
    assert_eq!(added.data["id"], "n1");
    assert!(added.data["_id"].as_str().is_some_and(|s| s.starts_with("temp_")));
    assert!(state.scheduler.is_pending(&note_insert_key("n1")));

    send(&state, a, EVENT_DELETE_STICKY_NOTE, json!({"id": "n1"})).await;
    assert_eq!(state.board.read().await.document.note_count(), 0);
    let deleted = test_helpers::recv_frame(&mut rx_b).await;
    assert_eq!(deleted.event, EVENT_NOTE_DELETED);
    assert_eq!(deleted.data["id"], "n1");
    assert_eq!(state.scheduler.pending_count(), 0);

    test_helpers::assert_no_frame(&mut rx_a).await;
}

#[tokio::test]
async fn add_note_without_id_is_stamped() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_ADD_NOTE, json!({"text": "anon"})).await;

    let notes = state.board.read().await.document.notes();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].id.starts_with("note_"));
    assert!(notes[0].last_updated.is_some());
}

#[tokio::test]
async fn add_note_accepts_numeric_client_id() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_ADD_NOTE, json!({"id": 1_700_000_000_000_i64, "text": "x"})).await;
    assert!(state.board.read().await.document.note("1700000000000").is_some());
}

#[tokio::test]
async fn delete_without_id_is_rejected() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;

    let replies = send(&state, a, EVENT_DELETE_STICKY_NOTE, json!({})).await;
    assert_eq!(replies[0].data["code"], "E_MISSING_NOTE_ID");
}

#[tokio::test]
async fn update_note_without_id_is_rejected_and_unknown_id_ignored() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    let replies = send(&state, a, EVENT_UPDATE_NOTE, json!({"text": "x"})).await;
    assert_eq!(replies[0].data["code"], "E_MISSING_NOTE_ID");

    let replies = send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "ghost", "text": "x"})).await;
    assert!(replies.is_empty());
    test_helpers::assert_no_frame(&mut rx_b).await;
    assert_eq!(state.scheduler.pending_count(), 0);
}

#[test]
fn note_updates_are_classified_by_flags() {
    let final_content = StickyNote { is_final_content: true, is_content_update: true, ..Default::default() };
    let final_position = StickyNote {
        is_final_position: true,
        position: Some(Position { x: 1.0, y: 1.0 }),
        ..Default::default()
    };
    let draft = StickyNote { is_content_update: true, ..Default::default() };
    let drag = StickyNote { position: Some(Position { x: 1.0, y: 1.0 }), ..Default::default() };
    let plain = StickyNote { color: Some("#fff".into()), ..Default::default() };

    assert_eq!(classify_note_update(&final_content), NoteUpdateKind::Final);
    assert_eq!(classify_note_update(&final_position), NoteUpdateKind::Final);
    assert_eq!(classify_note_update(&draft), NoteUpdateKind::ContentDraft);
    assert_eq!(classify_note_update(&drag), NoteUpdateKind::PositionDraft);
    assert_eq!(classify_note_update(&plain), NoteUpdateKind::Plain);
}

#[tokio::test(start_paused = true)]
async fn content_draft_broadcasts_without_persisting_and_final_persists() {
    let store = Arc::new(MemoryStore::new());
    let state = test_helpers::test_app_state_with_store(store.clone());
    state.board.write().await.document.upsert_note(test_helpers::note("n1", "hello"));
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "n1", "text": "hello w", "isContentUpdate": true})).await;

    assert!(test_helpers::drain(&mut rx_a).is_empty());
    let draft = test_helpers::drain(&mut rx_b);
    assert_eq!(events(&draft), vec![EVENT_UPDATE_NOTE]);
    assert_eq!(draft[0].data["text"], "hello w");
    assert!(!state.scheduler.is_pending(&note_update_key("n1")));
    past_debounce().await;
    assert_eq!(store.op_counts(), OpCounts::default());

    send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "n1", "text": "hello world", "isFinalContent": true})).await;

    assert_eq!(events(&test_helpers::drain(&mut rx_a)), vec![EVENT_UPDATE_NOTE]);
    assert_eq!(events(&test_helpers::drain(&mut rx_b)), vec![EVENT_UPDATE_NOTE]);
    past_debounce().await;
    assert_eq!(store.op_counts().updates, 1);
}

#[tokio::test]
async fn plain_update_goes_to_everyone() {
    let state = test_helpers::test_app_state();
    state.board.write().await.document.upsert_note(test_helpers::note("n1", "hi"));
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "n1", "color": "#000000"})).await;

    let echoed = test_helpers::recv_frame(&mut rx_a).await;
    assert_eq!(echoed.data["color"], "#000000");
    assert_eq!(echoed.data["text"], "hi");
    assert!(state.scheduler.is_pending(&note_update_key("n1")));
}

#[tokio::test(start_paused = true)]
async fn rapid_position_drafts_are_throttled() {
    let state = test_helpers::test_app_state();
    state.board.write().await.document.upsert_note(test_helpers::note("n1", "hi"));
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    let position_of = |state: &AppState| {
        let board = state.board.try_read().expect("board should be unlocked");
        board.document.note("n1").and_then(|n| n.position)
    };

    send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "n1", "position": {"x": 1, "y": 1}})).await;
    send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "n1", "position": {"x": 2, "y": 2}})).await;

    assert_eq!(test_helpers::drain(&mut rx_b).len(), 1);
    assert_eq!(position_of(&state), Some(Position { x: 1.0, y: 1.0 }));

    tokio::time::advance(Duration::from_millis(50)).await;
    send(&state, a, EVENT_UPDATE_NOTE, json!({"id": "n1", "position": {"x": 3, "y": 3}})).await;

    assert_eq!(test_helpers::drain(&mut rx_b).len(), 1);
    assert_eq!(position_of(&state), Some(Position { x: 3.0, y: 3.0 }));
    assert_eq!(state.scheduler.pending_count(), 0, "drafts are never persisted");
}

#[tokio::test]
async fn load_sticky_notes_replaces_cache_and_broadcasts() {
    let store = Arc::new(MemoryStore::new());
    crate::services::persistence::insert_note(store.as_ref(), &test_helpers::note("stored", "s"))
        .await
        .unwrap();
    let state = test_helpers::test_app_state_with_store(store.clone());
    state.board.write().await.document.upsert_note(test_helpers::note("local", "l"));
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    let replies = send(&state, a, EVENT_LOAD_STICKY_NOTES, serde_json::Value::Null).await;

    assert!(replies.is_empty());
    let board = state.board.read().await;
    assert!(board.document.note("local").is_none());
    assert!(board.document.note("stored").is_some());
    drop(board);
    assert_eq!(test_helpers::recv_frame(&mut rx_a).await.data[0]["id"], "stored");
    assert_eq!(test_helpers::recv_frame(&mut rx_b).await.event, EVENT_LOAD_STICKY_NOTES);
}

#[tokio::test]
async fn load_sticky_notes_falls_back_to_cache_when_store_down() {
    let store = Arc::new(MemoryStore::new());
    store.set_unreachable(true);
    let state = test_helpers::test_app_state_with_store(store);
    state.board.write().await.document.upsert_note(test_helpers::note("local", "l"));
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    let replies = send(&state, a, EVENT_LOAD_STICKY_NOTES, serde_json::Value::Null).await;

    assert_eq!(events(&replies), vec![EVENT_LOAD_STICKY_NOTES]);
    assert_eq!(replies[0].data[0]["id"], "local");
    assert_eq!(state.board.read().await.document.note_count(), 1);
    test_helpers::assert_no_frame(&mut rx_b).await;
}

// =============================================================================
// presence
// =============================================================================

#[tokio::test]
async fn update_user_info_merges_and_broadcasts_roster() {
    let state = test_helpers::test_app_state();
    let (a, mut rx_a) = test_helpers::connect_client(&state).await;
    let (_b, mut rx_b) = test_helpers::connect_client(&state).await;

    send(&state, a, EVENT_UPDATE_USER_INFO, json!({"initial": "Z"})).await;

    let roster = test_helpers::recv_frame(&mut rx_b).await;
    let me = roster
        .data
        .as_array()
        .and_then(|r| r.iter().find(|c| c["connectionId"] == json!(a)))
        .expect("sender should be in roster");
    assert_eq!(me["initial"], "Z");
    assert_eq!(test_helpers::recv_frame(&mut rx_a).await.event, "users-update");
}

#[test]
fn temp_storage_ids_have_expected_shape() {
    let id = temp_storage_id(42);
    let suffix = id.strip_prefix("temp_42_").expect("prefix should match");
    assert_eq!(suffix.len(), 7);
    assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
}

// =============================================================================
// end to end
// =============================================================================

type WsClient = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_frame(ws: &mut WsClient) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("server frame timed out")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("server frame should parse");
        }
    }
}

#[tokio::test]
async fn websocket_clients_share_strokes_end_to_end() {
    let state = test_helpers::test_app_state();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, crate::routes::app(state)).await.unwrap();
    });
    let url = format!("ws://{addr}/socket");

    let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let mut handshake = Vec::new();
    for _ in 0..4 {
        handshake.push(next_frame(&mut a).await);
    }
    assert_eq!(
        events(&handshake),
        vec![EVENT_CONNECTED, EVENT_LOAD_DRAWING, EVENT_LOAD_STICKY_NOTES, "users-update"]
    );

    let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    for _ in 0..4 {
        next_frame(&mut b).await;
    }
    assert_eq!(next_frame(&mut a).await.event, "users-update");

    a.send(WsMessage::Text(inbound(EVENT_DRAW, json!({"x": 1, "y": 1})).into()))
        .await
        .unwrap();

    assert_eq!(next_frame(&mut b).await.event, "users-update");
    let stroke = next_frame(&mut b).await;
    assert_eq!(stroke.event, EVENT_DRAW);
    assert_eq!(stroke.data, json!({"x": 1, "y": 1}));

    b.send(WsMessage::Text(inbound(EVENT_DRAW, json!({"x": 2, "y": 2})).into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut b).await.event, EVENT_DRAWING_NOT_ALLOWED);
}

#[tokio::test]
async fn client_vanishing_mid_reply_is_disconnected_and_releases_turn() {
    let state = test_helpers::test_app_state();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app_state = state.clone();
    tokio::spawn(async move {
        axum::serve(listener, crate::routes::app(app_state)).await.unwrap();
    });
    let url = format!("ws://{addr}/socket");

    let (mut watcher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    for _ in 0..4 {
        next_frame(&mut watcher).await;
    }
    let (mut leaver, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    for _ in 0..4 {
        next_frame(&mut leaver).await;
    }
    leaver
        .send(WsMessage::Text(inbound(EVENT_DRAW, json!({"x": 1})).into()))
        .await
        .unwrap();
    leaver
        .send(WsMessage::Text(inbound(EVENT_LOAD_DRAW, serde_json::Value::Null).into()))
        .await
        .unwrap();
    drop(leaver);

    loop {
        let frame = next_frame(&mut watcher).await;
        if frame.event == "users-update" && frame.data.as_array().map(Vec::len) == Some(1) {
            break;
        }
    }
    let board = state.board.read().await;
    assert_eq!(board.turn.holder(), None);
    assert_eq!(board.clients.len(), 1);
}
