//! Integration tests for optimistic kanban moves against a mock REST server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use case_sync::api::ApiClient;
use case_sync::error::MutationError;
use case_sync::kanban::{BoardCard, KanbanBoard, MoveOutcome, Notifier};
use case_sync::optimistic::EditStatus;
use case_sync::protocol::EntityId;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct Toasts(Mutex<Vec<String>>);

impl Notifier for Toasts {
    fn error(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

fn card(id: i64, status: &str) -> BoardCard {
    BoardCard {
        id: EntityId::Num(id),
        status: status.to_string(),
    }
}

fn board_for(server: &MockServer, toasts: &Arc<Toasts>) -> KanbanBoard {
    let api = Arc::new(ApiClient::new(server.uri(), "tok").unwrap());
    let board = KanbanBoard::new(api, Arc::clone(toasts) as _);
    board.load([card(1, "em_analise"), card(2, "aprovado")]);
    board
}

#[tokio::test]
async fn test_server_error_rolls_back_and_shows_toast() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/processes/kanban/1/move"))
        .and(query_param("new_status", "aprovado"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let toasts = Arc::new(Toasts::default());
    let board = board_for(&server, &toasts);

    let outcome = board.move_card(&EntityId::Num(1), "aprovado").await.unwrap();

    let MoveOutcome::RolledBack { edit, error } = outcome else {
        panic!("expected rollback, got {outcome:?}");
    };
    assert_eq!(error, MutationError::Rejected { status: 500 });
    assert_eq!(edit.status, EditStatus::RolledBack);
    assert_eq!(board.status_of(&EntityId::Num(1)).as_deref(), Some("em_analise"));
    assert!(!board.is_pending(&EntityId::Num(1)));
    assert_eq!(
        *toasts.0.lock().unwrap(),
        vec!["Erro ao mover processo".to_string()]
    );
}

#[tokio::test]
async fn test_success_keeps_new_column() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/processes/kanban/1/move"))
        .and(query_param("new_status", "aprovado"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let toasts = Arc::new(Toasts::default());
    let board = board_for(&server, &toasts);

    let outcome = board.move_card(&EntityId::Num(1), "aprovado").await.unwrap();

    assert!(matches!(outcome, MoveOutcome::Confirmed(_)));
    assert_eq!(
        board.column("aprovado"),
        vec![EntityId::Num(1), EntityId::Num(2)]
    );
    assert!(toasts.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_server_times_out_and_rolls_back() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let toasts = Arc::new(Toasts::default());
    let board = board_for(&server, &toasts).with_timeout(Duration::from_millis(50));

    let outcome = board.move_card(&EntityId::Num(1), "aprovado").await.unwrap();

    assert_eq!(
        outcome.error(),
        Some(&MutationError::Timeout(Duration::from_millis(50)))
    );
    assert_eq!(board.status_of(&EntityId::Num(1)).as_deref(), Some("em_analise"));
    assert_eq!(toasts.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_move_resyncs_board() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/processes/kanban"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "status": "arquivado"},
            {"id": 2, "status": "aprovado"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let api = Arc::new(ApiClient::new(server.uri(), "tok").unwrap());
    let toasts = Arc::new(Toasts::default());
    let board = KanbanBoard::new(Arc::clone(&api) as _, Arc::clone(&toasts) as _).with_source(api);
    board.load([card(1, "em_analise"), card(2, "aprovado")]);

    let outcome = board.move_card(&EntityId::Num(1), "aprovado").await.unwrap();
    assert_eq!(outcome.error(), Some(&MutationError::Rejected { status: 409 }));

    assert_eq!(board.status_of(&EntityId::Num(1)).as_deref(), Some("arquivado"));
    assert_eq!(toasts.0.lock().unwrap().len(), 1);
}
