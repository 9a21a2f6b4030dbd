//! Shared setup for the HTTP tests: an in-memory database with a few
//! accounts and subjects, and the full router on top of it.

use std::sync::OnceLock;

use axum::Router;
use axum_test::TestServer;
use serde_json::{json, Value};

use tutor_matcher::{
    auth::hash_password,
    config::Settings,
    db::{Database, NewUser},
    model::UserId,
    web::{router, AppState},
};

pub const PASSWORD: &str = "correct horse";

/// Hashing is slow in debug builds, so every test account shares one hash.
fn password_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password(PASSWORD).unwrap())
}

pub struct TestContext {
    pub db: Database,
    app: Router,
}

impl TestContext {
    /// Seeds `admin01` plus tutors and pupils, and the subjects MA and DE.
    pub fn new() -> Self {
        let db = Database::in_memory().unwrap();
        db.upsert_subject("MA", "Mathematik").unwrap();
        db.upsert_subject("DE", "Deutsch").unwrap();

        let ctx = Self {
            app: router(AppState::new(db.clone(), Settings::default()).unwrap()),
            db,
        };
        ctx.add_user("admin01", "Ada Admin", true);
        ctx.add_user("tutor01", "Tina Tutor", false);
        ctx.add_user("pupil01", "Paul Pupil", false);
        ctx.add_user("pupil02", "Petra Pupil", false);
        ctx
    }

    pub fn add_user(&self, username: &str, name: &str, admin: bool) -> UserId {
        self.db
            .add_user(&NewUser {
                username,
                name,
                class_name: Some("9a"),
                password_hash: password_hash(),
                start_password: None,
                admin,
            })
            .unwrap()
    }

    pub fn server(&self) -> TestServer {
        TestServer::new(self.app.clone()).unwrap()
    }

    pub fn auth_header_value(token: &str) -> String {
        format!("Bearer {}", token)
    }

    /// Logs `username` in with the shared password and returns the token.
    pub async fn login(&self, server: &TestServer, username: &str) -> String {
        let response = server
            .post("/api/login")
            .json(&json!({ "username": username, "password": PASSWORD }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        body["token"].as_str().unwrap().to_owned()
    }
}

pub fn monday(slots: &[u8]) -> Value {
    json!({ "mon": slots })
}
