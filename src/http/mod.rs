mod http_error;
mod job_info;

use self::http_error::HttpError;
use self::job_info::JobInfo;
use crate::auth::{self, AuthError, Credentials, Registration};
use crate::database::User;
use crate::error::JobError;
use crate::packager;
use crate::state::AppState;
use crate::upload::ScriptUpload;
use actix_multipart::Multipart;
use actix_web::dev::Payload;
use actix_web::http::header::{self, ContentDisposition, DispositionParam, DispositionType};
use actix_web::web::{self, Data, Json, Path};
use actix_web::{
    delete, get, middleware, post, App, FromRequest, HttpRequest, HttpResponse, HttpServer,
    Responder,
};
use anyhow::anyhow;
use futures_util::future::{ready, Ready};
use futures_util::StreamExt;
use log::{info, warn};
use serde_json::json;

/// The user that a request's bearer token belongs to
pub struct AuthUser {
    user: User,
    token: String,
}

impl AuthUser {
    fn from_request_sync(req: &HttpRequest) -> Result<Self, HttpError> {
        let state = req
            .app_data::<Data<AppState>>()
            .ok_or_else(|| anyhow!("App state is not configured"))?;
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(auth::bearer_token)
            .ok_or(AuthError::Unauthorized)?;
        let user = state.authenticate(token)?;
        Ok(Self {
            user,
            token: token.to_owned(),
        })
    }
}

impl FromRequest for AuthUser {
    type Error = HttpError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Self::from_request_sync(req))
    }
}

fn user_json(user: &User) -> serde_json::Value {
    json!({
        "id": user.id,
        "username": user.username,
        "email": user.email,
        "created_at": user.created_at,
    })
}

#[post("/register")]
async fn register(
    registration: Json<Registration>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let user = web::block(move || state.register(registration.into_inner())).await??;
    Ok(HttpResponse::Created().json(user_json(&user)))
}

#[post("/login")]
async fn login(
    credentials: Json<Credentials>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let (token, user) = web::block(move || state.login(&credentials)).await??;
    Ok(Json(json!({
        "token": token,
        "user": user_json(&user),
    })))
}

#[post("/logout")]
async fn logout(auth: AuthUser, state: Data<AppState>) -> Result<impl Responder, HttpError> {
    state.logout(&auth.token)?;
    Ok(Json(json!({ "message": "Logged out" })))
}

#[get("/jobs")]
async fn list_jobs(auth: AuthUser, state: Data<AppState>) -> Result<impl Responder, HttpError> {
    let (jobs, stats) = state.recent_jobs(&auth.user)?;
    Ok(Json(json!({
        "jobs": jobs.iter().map(JobInfo::from_job).collect::<Vec<_>>(),
        "stats": stats,
    })))
}

/// Read the `file` field of a multipart upload, enforcing the size limit while streaming
async fn read_script_field(
    payload: &mut Multipart,
    limit: usize,
) -> Result<(String, Vec<u8>), HttpError> {
    while let Some(field) = payload.next().await {
        let mut field = field?;
        let content_disposition = field.content_disposition();
        let is_file = content_disposition.get_name() == Some("file");
        let file_name = content_disposition
            .get_filename()
            .unwrap_or_default()
            .to_owned();

        if !is_file {
            // Drain fields that aren't used
            while let Some(chunk) = field.next().await {
                chunk?;
            }
            continue;
        }

        let mut contents = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if contents.len() + chunk.len() > limit {
                return Err(JobError::UploadTooLarge { limit }.into());
            }
            contents.extend_from_slice(&chunk);
        }
        return Ok((file_name, contents));
    }

    Err(HttpError::bad_request("No file part"))
}

#[post("/jobs")]
async fn upload(
    auth: AuthUser,
    mut payload: Multipart,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let config = state.config();
    let (file_name, contents) = read_script_field(&mut payload, config.max_upload_size).await?;
    let upload = ScriptUpload::new(&file_name, contents, config)?;
    for warning in &upload.warnings {
        warn!("{}: {warning}", upload.file_name);
    }

    let job = state.create_job(&auth.user, &upload)?;
    Ok(HttpResponse::Created().json(json!({
        "job": JobInfo::from_job(&job),
        "warnings": upload.warnings,
    })))
}

#[get("/jobs/{id}")]
async fn view_job(
    auth: AuthUser,
    id: Path<i32>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let job = state.get_job(&auth.user, id.into_inner())?;
    let files = match packager::list_results(&job) {
        Ok(files) => files,
        Err(JobError::NoResults(_)) => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    Ok(Json(json!({
        "job": JobInfo::with_log(&job),
        "files": files,
    })))
}

#[get("/jobs/{id}/status")]
async fn job_status(
    auth: AuthUser,
    id: Path<i32>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let job = JobInfo::with_log(&state.get_job(&auth.user, id.into_inner())?);
    Ok(Json(json!({
        "id": job.id,
        "status": job.status,
        "log": job.log,
        "error": job.error_message,
        "finished_at": job.finished_at,
        "duration": job.duration,
    })))
}

#[post("/jobs/{id}/run")]
async fn run_job(
    auth: AuthUser,
    id: Path<i32>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let job_id = id.into_inner();
    info!("{} is running job {job_id}", auth.user.username);
    let job = web::block(move || state.run_job(&auth.user, job_id)).await??;
    Ok(Json(JobInfo::with_log(&job)))
}

#[post("/jobs/{id}/cancel")]
async fn cancel_job(
    auth: AuthUser,
    id: Path<i32>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let job = state.cancel_job(&auth.user, id.into_inner())?;
    Ok(Json(json!({
        "message": "Execution cancelled",
        "job": JobInfo::from_job(&job),
    })))
}

#[get("/jobs/{id}/download")]
async fn download(
    auth: AuthUser,
    id: Path<i32>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let job_id = id.into_inner();
    let archive = web::block(move || state.package(&auth.user, job_id)).await??;
    Ok(HttpResponse::Ok()
        .content_type("application/zip")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(archive.file_name)],
        })
        .body(archive.bytes))
}

#[delete("/jobs/{id}")]
async fn delete_job(
    auth: AuthUser,
    id: Path<i32>,
    state: Data<AppState>,
) -> Result<impl Responder, HttpError> {
    let job = state.delete_job(&auth.user, id.into_inner())?;
    Ok(Json(json!({
        "message": format!("Deleted job {}", job.id),
    })))
}

#[get("/system-info")]
async fn system_info(_auth: AuthUser, state: Data<AppState>) -> impl Responder {
    Json(state.system_info())
}

/// Register every route
pub fn configure(config: &mut web::ServiceConfig) {
    config
        .app_data(
            web::JsonConfig::default()
                .error_handler(|err, _| HttpError::bad_request(err.to_string()).into()),
        )
        .service(register)
        .service(login)
        .service(logout)
        .service(list_jobs)
        .service(upload)
        .service(view_job)
        .service(job_status)
        .service(run_job)
        .service(cancel_job)
        .service(download)
        .service(delete_job)
        .service(system_info);
}

pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<(), std::io::Error> {
    info!("Starting HTTP server on {host}:{port}");
    let state = Data::new(state);
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Compress::default())
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((host, port))?
    .run()
    .await
}
