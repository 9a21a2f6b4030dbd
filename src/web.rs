use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Html,
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::{
        generate_start_password, hash_password, new_session_token, verify_password, AdminUser,
        CurrentUser,
    },
    config::Settings,
    db::{
        ContactConsent, Database, MatchOverview, MatchRun, NewUser, OfferListing, ProfileUpdate,
        RequestListing, StartPassword, Subject, User,
    },
    engine::{compute, run_matching, SnapshotProvider},
    error::{ApiError, ApiResult},
    materialize::MatchingReport,
    model::{ClassRange, OfferId, RequestId},
    schedule::Availability,
};

const MIN_CLASS: u8 = 1;
const MAX_CLASS: u8 = 13;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub tera: Arc<Tera>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(db: Database, settings: Settings) -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_template("matches.html", include_str!("../templates/matches.html"))?;
        Ok(Self {
            db,
            tera: Arc::new(tera),
            settings: Arc::new(settings),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/me", get(me).patch(update_me))
        .route("/api/me/password", post(change_password))
        .route("/api/subjects", get(subjects))
        .route("/api/offers", get(list_offers).post(create_offer))
        .route("/api/offers/:id", delete(delete_offer))
        .route("/api/requests", get(list_requests).post(create_request))
        .route("/api/requests/:id", delete(delete_request))
        .route("/api/admin/match", post(trigger_matching))
        .route("/api/admin/match/preview", get(preview_matching))
        .route("/api/admin/matches", get(matches))
        .route("/admin/matches", get(matches_page))
        .route("/api/admin/users", post(import_users))
        .route("/api/admin/start-passwords", get(start_passwords))
        .route("/api/admin/admin-state", post(change_admin_state))
        .route("/api/admin/subjects", post(add_subject))
        .route("/api/admin/offers", delete(clear_offers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn validate_username(username: &str) -> ApiResult<()> {
    let valid = (5..=32).contains(&username.len())
        && username.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(ApiError::BadRequest(format!(
            "username `{username}` must be 5 to 32 letters or digits"
        )));
    }
    Ok(())
}

fn validate_password(password: &str) -> ApiResult<()> {
    if !(8..=256).contains(&password.len()) {
        return Err(ApiError::BadRequest(
            "password must be 8 to 256 characters".to_owned(),
        ));
    }
    Ok(())
}

fn validate_classes(min: u8, max: u8) -> ApiResult<ClassRange> {
    if !(MIN_CLASS..=MAX_CLASS).contains(&min) || !(MIN_CLASS..=MAX_CLASS).contains(&max) {
        return Err(ApiError::BadRequest(format!(
            "class levels must lie between {MIN_CLASS} and {MAX_CLASS}"
        )));
    }
    if min > max {
        return Err(ApiError::BadRequest(format!(
            "min_class {min} is above max_class {max}"
        )));
    }
    Ok(ClassRange { min, max })
}

fn validate_profile(update: &ProfileUpdate) -> ApiResult<()> {
    if let Some(name) = &update.name {
        if name.trim().is_empty() || name.len() > 64 {
            return Err(ApiError::BadRequest(
                "name must be 1 to 64 characters".to_owned(),
            ));
        }
    }
    if let Some(email) = update.email.as_deref().filter(|e| !e.is_empty()) {
        let valid = email.len() <= 254
            && email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid {
            return Err(ApiError::BadRequest(format!("`{email}` is not an email address")));
        }
    }
    if let Some(phone) = update.phone.as_deref().filter(|p| !p.is_empty()) {
        let valid = (3..=32).contains(&phone.len())
            && phone
                .chars()
                .all(|c| c.is_ascii_digit() || " +-/()".contains(c));
        if !valid {
            return Err(ApiError::BadRequest(format!("`{phone}` is not a phone number")));
        }
    }
    Ok(())
}

fn validate_lesson(state: &AppState, subject: &str, availability: &Availability) -> ApiResult<()> {
    if !state.db.subject_exists(subject)? {
        return Err(ApiError::BadRequest(format!("unknown subject `{subject}`")));
    }
    if availability.is_empty() {
        return Err(ApiError::BadRequest("availability has no slots".to_owned()));
    }
    Ok(())
}

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    user: User,
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(form): Json<LoginForm>,
) -> ApiResult<(CookieJar, Json<LoginResponse>)> {
    let username = form.username.to_lowercase();
    let credentials = state
        .db
        .credentials(&username)?
        .filter(|c| verify_password(&form.password, &c.password_hash))
        .ok_or_else(|| ApiError::Unauthorized("username or password incorrect".to_owned()))?;

    let token = new_session_token();
    let expires_at = Utc::now() + Duration::hours(state.settings.auth.session_hours);
    state
        .db
        .create_session(&token, credentials.user.id, expires_at)?;
    info!(username = %credentials.user.username, "user logged in");

    let cookie = Cookie::build((state.settings.auth.cookie_name.clone(), token.clone()))
        .path("/")
        .http_only(true);
    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            token,
            user: credentials.user,
        }),
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    current: CurrentUser,
    jar: CookieJar,
) -> ApiResult<(CookieJar, StatusCode)> {
    state.db.delete_session(&current.token)?;
    let cookie = Cookie::build((state.settings.auth.cookie_name.clone(), "")).path("/");
    Ok((jar.remove(cookie), StatusCode::NO_CONTENT))
}

pub async fn me(current: CurrentUser) -> Json<User> {
    Json(current.user)
}

/// Sets name, email or phone. Clears the first-login flag.
pub async fn update_me(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<Json<User>> {
    validate_profile(&update)?;
    state.db.update_profile(current.user.id, &update)?;
    let user = state
        .db
        .user(current.user.id)?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", current.user.id)))?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct PasswordChange {
    old_password: String,
    new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(change): Json<PasswordChange>,
) -> ApiResult<StatusCode> {
    let stored = state
        .db
        .password_hash(current.user.id)?
        .ok_or_else(|| ApiError::NotFound(format!("user {}", current.user.id)))?;
    if !verify_password(&change.old_password, &stored) {
        return Err(ApiError::Unauthorized("old password incorrect".to_owned()));
    }
    validate_password(&change.new_password)?;
    state
        .db
        .update_password(current.user.id, &hash_password(&change.new_password)?)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn subjects(State(state): State<AppState>) -> ApiResult<Json<Vec<Subject>>> {
    Ok(Json(state.db.subjects()?))
}

#[derive(Debug, Serialize)]
pub struct Created<T> {
    id: T,
}

#[derive(Debug, Deserialize)]
pub struct OfferForm {
    subject: String,
    availability: Availability,
    min_class: u8,
    max_class: u8,
    #[serde(flatten)]
    consent: ContactConsent,
}

pub async fn list_offers(
    State(state): State<AppState>,
    current: CurrentUser,
) -> ApiResult<Json<Vec<OfferListing>>> {
    Ok(Json(state.db.offers_of(current.user.id)?))
}

pub async fn create_offer(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<OfferForm>,
) -> ApiResult<(StatusCode, Json<Created<OfferId>>)> {
    let classes = validate_classes(form.min_class, form.max_class)?;
    validate_lesson(&state, &form.subject, &form.availability)?;
    let id = state.db.add_offer(
        current.user.id,
        &form.subject,
        &form.availability,
        classes,
        form.consent,
    )?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

pub async fn delete_offer(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if !state.db.delete_offer(current.user.id, OfferId(id))? {
        return Err(ApiError::NotFound(format!("offer {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RequestForm {
    subject: String,
    availability: Availability,
    #[serde(flatten)]
    consent: ContactConsent,
}

pub async fn list_requests(
    State(state): State<AppState>,
    current: CurrentUser,
) -> ApiResult<Json<Vec<RequestListing>>> {
    Ok(Json(state.db.requests_of(current.user.id)?))
}

pub async fn create_request(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(form): Json<RequestForm>,
) -> ApiResult<(StatusCode, Json<Created<RequestId>>)> {
    validate_lesson(&state, &form.subject, &form.availability)?;
    let id = state
        .db
        .add_request(current.user.id, &form.subject, &form.availability, form.consent)?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

pub async fn delete_request(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if !state.db.delete_request(current.user.id, RequestId(id))? {
        return Err(ApiError::NotFound(format!("request {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Recomputes all matches and replaces the stored set.
pub async fn trigger_matching(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> ApiResult<Json<MatchingReport>> {
    info!(admin = %admin.username, "start matching");
    let db = state.db.clone();
    let policy = state.settings.matching.policy();
    let report = tokio::task::spawn_blocking(move || run_matching(&db, &db, &policy))
        .await
        .map_err(|e| ApiError::Internal(format!("matching task failed: {e}")))??;
    Ok(Json(report))
}

/// Computes what a run would produce without storing anything.
pub async fn preview_matching(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<MatchingReport>> {
    let db = state.db.clone();
    let policy = state.settings.matching.policy();
    let report = tokio::task::spawn_blocking(move || -> ApiResult<MatchingReport> {
        let snapshot = db.snapshot()?;
        Ok(compute(&snapshot, &policy)?)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("preview task failed: {e}")))??;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct MatchesResponse {
    run: Option<MatchRun>,
    matches: Vec<MatchOverview>,
}

pub async fn matches(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<MatchesResponse>> {
    Ok(Json(MatchesResponse {
        run: state.db.latest_run()?,
        matches: state.db.match_overview()?,
    }))
}

pub async fn matches_page(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Html<String>> {
    let matches = state.db.match_overview()?;
    let mut context = Context::new();
    context.insert("run", &state.db.latest_run()?);
    context.insert(
        "matched",
        &matches.iter().filter(|m| m.offer_id.is_some()).count(),
    );
    context.insert("matches", &matches);
    Ok(Html(state.tera.render("matches.html", &context)?))
}

#[derive(Debug, Deserialize)]
pub struct ImportedUser {
    username: String,
    name: Option<String>,
    class_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportReport {
    created: Vec<StartPassword>,
    existing: Vec<String>,
}

/// Creates accounts with random start passwords. Existing usernames are skipped.
pub async fn import_users(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(users): Json<Vec<ImportedUser>>,
) -> ApiResult<Json<ImportReport>> {
    for user in &users {
        validate_username(&user.username.to_lowercase())?;
    }

    // Hashing takes a moment per account.
    let db = state.db.clone();
    let report = tokio::task::spawn_blocking(move || create_accounts(&db, users))
        .await
        .map_err(|e| ApiError::Internal(format!("import task failed: {e}")))??;

    info!(
        created = report.created.len(),
        skipped = report.existing.len(),
        "imported users"
    );
    Ok(Json(report))
}

fn create_accounts(db: &Database, users: Vec<ImportedUser>) -> ApiResult<ImportReport> {
    let mut report = ImportReport {
        created: Vec::new(),
        existing: Vec::new(),
    };
    for user in users {
        let username = user.username.to_lowercase();
        if db.user_exists(&username)? {
            report.existing.push(username);
            continue;
        }
        let password = generate_start_password();
        db.add_user(&NewUser {
            username: &username,
            name: user.name.as_deref().unwrap_or(&username),
            class_name: user.class_name.as_deref(),
            password_hash: &hash_password(&password)?,
            start_password: Some(&password),
            admin: false,
        })?;
        report.created.push(StartPassword { username, password });
    }
    Ok(report)
}

/// Unused start passwords by class, for handing out printed lists.
pub async fn start_passwords(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<BTreeMap<String, Vec<StartPassword>>>> {
    Ok(Json(state.db.start_passwords()?))
}

#[derive(Debug, Deserialize)]
pub struct AdminState {
    username: String,
    admin: bool,
}

pub async fn change_admin_state(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(change): Json<AdminState>,
) -> ApiResult<StatusCode> {
    if !state.db.set_admin(&change.username, change.admin)? {
        return Err(ApiError::NotFound(format!("user {}", change.username)));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SubjectForm {
    code: String,
    name: String,
}

pub async fn add_subject(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(form): Json<SubjectForm>,
) -> ApiResult<StatusCode> {
    if form.code.is_empty() || form.code.len() > 4 {
        return Err(ApiError::BadRequest(
            "subject code must be 1 to 4 characters".to_owned(),
        ));
    }
    state.db.upsert_subject(&form.code, &form.name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_offers(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> ApiResult<StatusCode> {
    info!(admin = %admin.username, "clearing offers");
    state.db.clear_offers()?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_alphanumeric_and_bounded() {
        assert!(validate_username("mustmax00").is_ok());
        assert!(validate_username("abc").is_err());
        assert!(validate_username("must max").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn profile_fields_are_checked() {
        let valid = ProfileUpdate {
            name: Some("Paul Pupil".to_owned()),
            email: Some("paul@example.org".to_owned()),
            phone: Some("+49 (0)30 1234-56".to_owned()),
        };
        assert!(validate_profile(&valid).is_ok());
        let clearing = ProfileUpdate {
            email: Some(String::new()),
            phone: Some(String::new()),
            ..ProfileUpdate::default()
        };
        assert!(validate_profile(&clearing).is_ok());

        for update in [
            ProfileUpdate {
                name: Some("  ".to_owned()),
                ..ProfileUpdate::default()
            },
            ProfileUpdate {
                email: Some("no-at-sign".to_owned()),
                ..ProfileUpdate::default()
            },
            ProfileUpdate {
                phone: Some("call me".to_owned()),
                ..ProfileUpdate::default()
            },
        ] {
            assert!(validate_profile(&update).is_err(), "{update:?}");
        }
    }

    #[test]
    fn class_range_is_checked() {
        assert_eq!(validate_classes(5, 7).unwrap(), ClassRange { min: 5, max: 7 });
        assert!(validate_classes(7, 7).is_ok());
        assert!(validate_classes(8, 7).is_err());
        assert!(validate_classes(0, 7).is_err());
        assert!(validate_classes(5, 14).is_err());
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
    }
}
