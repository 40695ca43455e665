//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use chrono::Utc;
use uuid::Uuid;

use foresight_backend::models::{QuestionType, SessionPhase, SessionRow, SessionStatus};
use foresight_backend::store::Store;

pub async fn insert_session(store: &Store, question: &str) -> String {
    let id = Uuid::new_v4().to_string();
    store
        .insert_session(&SessionRow {
            id: id.clone(),
            question_text: question.to_string(),
            question_type: QuestionType::Binary,
            status: SessionStatus::Running,
            current_phase: SessionPhase::Created,
            tokens_used: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
        .await
        .unwrap();
    id
}
