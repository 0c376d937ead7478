//! Categories, posts, comments, and likes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use campus_sdk::models::{
    Category, Comment, LikeResponse, NewCategory, NewComment, NewPost, NotificationKind, Post, UpdatePost,
};

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::db::PostFilter;
use crate::error::{ApiError, ApiResult};
use crate::server::SharedState;
use crate::web::page_limit;

const MAX_TITLE: usize = 200;
const MAX_CONTENT: usize = 20_000;
const MAX_COMMENT: usize = 2_000;
const MAX_IMAGES: usize = 9;

pub fn routes() -> Router<Arc<SharedState>> {
    Router::new()
        .route("/api/categories", get(list_categories).post(create_category))
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/{id}", get(get_post).patch(update_post).delete(delete_post))
        .route("/api/posts/{id}/like", post(like).delete(unlike))
        .route("/api/posts/{id}/comments", get(list_comments).post(add_comment))
        .route("/api/comments/{id}", delete(delete_comment))
}

async fn list_categories(State(state): State<Arc<SharedState>>) -> ApiResult<Json<Vec<Category>>> {
    Ok(Json(state.with_db(|db| db.list_categories())?))
}

async fn create_category(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Json(req): Json<NewCategory>,
) -> ApiResult<(StatusCode, Json<Category>)> {
    user.require_admin()?;
    let slug_ok = !req.slug.is_empty()
        && req.slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !slug_ok {
        return Err(ApiError::bad_request("slug must be letters, digits, or '-'"));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let category = state.with_db(|db| db.create_category(&req))?;
    Ok((StatusCode::CREATED, Json(category)))
}

#[derive(Debug, Deserialize)]
struct PostQuery {
    category: Option<String>,
    author: Option<String>,
    before: Option<String>,
    limit: Option<usize>,
}

async fn list_posts(
    State(state): State<Arc<SharedState>>,
    viewer: MaybeAuthUser,
    Query(q): Query<PostQuery>,
) -> ApiResult<Json<Vec<Post>>> {
    let filter = PostFilter {
        category: q.category.filter(|s| !s.is_empty()),
        author: q.author.filter(|s| !s.is_empty()),
        before: q.before.filter(|s| !s.is_empty()),
        limit: page_limit(q.limit, 20, 100),
    };
    Ok(Json(state.with_db(|db| db.list_posts(&filter, viewer.uid()))?))
}

fn validate_post_fields(title: Option<&str>, content: Option<&str>, images: Option<&[String]>) -> ApiResult<()> {
    if let Some(t) = title {
        let len = t.trim().chars().count();
        if len == 0 || len > MAX_TITLE {
            return Err(ApiError::bad_request(format!("title must be 1-{MAX_TITLE} characters")));
        }
    }
    if let Some(c) = content {
        if c.trim().is_empty() || c.chars().count() > MAX_CONTENT {
            return Err(ApiError::bad_request(format!("content must be 1-{MAX_CONTENT} characters")));
        }
    }
    if images.is_some_and(|i| i.len() > MAX_IMAGES) {
        return Err(ApiError::bad_request(format!("at most {MAX_IMAGES} images per post")));
    }
    Ok(())
}

async fn create_post(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Json(mut req): Json<NewPost>,
) -> ApiResult<(StatusCode, Json<Post>)> {
    validate_post_fields(Some(&req.title), Some(&req.content), Some(&req.image_urls))?;
    let post = state.with_db(|db| {
        if let Some(c) = req.category_id.as_deref().filter(|c| !c.is_empty()) {
            // Accept a slug as well as an id.
            req.category_id = db.get_category(c)?.map(|cat| cat.id);
            if req.category_id.is_none() {
                return Ok(None);
            }
        } else {
            req.category_id = None;
        }
        db.create_post(user.uid(), &req, false).map(Some)
    })?;
    let post = post.ok_or_else(|| ApiError::bad_request("unknown category"))?;
    tracing::info!(post = %post.id, author = %post.author_id, "Post created");
    Ok((StatusCode::CREATED, Json(post)))
}

async fn get_post(
    State(state): State<Arc<SharedState>>,
    viewer: MaybeAuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Post>> {
    let post = state.with_db(|db| {
        db.increment_views(&id)?;
        db.get_post(&id, viewer.uid())
    })?;
    Ok(Json(post.ok_or_else(|| ApiError::not_found("post"))?))
}

/// Load a post and check the caller may modify it (author or admin).
fn owned_post(state: &SharedState, id: &str, user: &AuthUser) -> ApiResult<Post> {
    let post = state
        .with_db(|db| db.get_post(id, Some(user.uid())))?
        .ok_or_else(|| ApiError::not_found("post"))?;
    if post.author_id != user.uid() && !user.is_admin {
        return Err(ApiError::forbidden("only the author can modify this post"));
    }
    Ok(post)
}

async fn update_post(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(mut req): Json<UpdatePost>,
) -> ApiResult<Json<Post>> {
    owned_post(&state, &id, &user)?;
    validate_post_fields(req.title.as_deref(), req.content.as_deref(), req.image_urls.as_deref())?;
    if let Some(c) = req.category_id.as_deref().filter(|c| !c.is_empty()) {
        // Store the id even when the caller sent a slug.
        let category = state
            .with_db(|db| db.get_category(c))?
            .ok_or_else(|| ApiError::bad_request("unknown category"))?;
        req.category_id = Some(category.id);
    }
    let post = state
        .with_db(|db| db.update_post(&id, &req))?
        .ok_or_else(|| ApiError::not_found("post"))?;
    Ok(Json(post))
}

async fn delete_post(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_post(&state, &id, &user)?;
    state.with_db(|db| db.delete_post(&id))?;
    tracing::info!(post = %id, by = %user.uid(), "Post deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn like(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<LikeResponse>> {
    let (newly, count) = state.with_db(|db| {
        let result = db.like_post(&id, user.uid())?;
        if let Some((true, _)) = result {
            if let Some(post) = db.get_post(&id, None)? {
                let text = format!("{} liked your post \"{}\"", user.profile.display_name, post.title);
                db.create_notification(&post.author_id, NotificationKind::Like, Some(user.uid()), Some(&id), &text)?;
            }
        }
        Ok(result)
    })?
    .ok_or_else(|| ApiError::not_found("post"))?;
    tracing::debug!(post = %id, newly, "Like");
    Ok(Json(LikeResponse { post_id: id, liked: true, like_count: count }))
}

async fn unlike(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<LikeResponse>> {
    let (_, count) = state
        .with_db(|db| db.unlike_post(&id, user.uid()))?
        .ok_or_else(|| ApiError::not_found("post"))?;
    Ok(Json(LikeResponse { post_id: id, liked: false, like_count: count }))
}

#[derive(Debug, Deserialize)]
struct CommentQuery {
    limit: Option<usize>,
}

async fn list_comments(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
    Query(q): Query<CommentQuery>,
) -> ApiResult<Json<Vec<Comment>>> {
    let limit = page_limit(q.limit, 100, 500);
    let comments = state.with_db(|db| {
        if db.get_post(&id, None)?.is_none() {
            return Ok(None);
        }
        db.list_comments(&id, limit).map(Some)
    })?;
    Ok(Json(comments.ok_or_else(|| ApiError::not_found("post"))?))
}

async fn add_comment(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<NewComment>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let content = req.content.trim();
    if content.is_empty() || content.chars().count() > MAX_COMMENT {
        return Err(ApiError::bad_request(format!("comment must be 1-{MAX_COMMENT} characters")));
    }
    let comment = state.with_db(|db| {
        let Some(comment) = db.add_comment(&id, user.uid(), content)? else {
            return Ok(None);
        };
        if let Some(post) = db.get_post(&id, None)? {
            let preview: String = content.chars().take(80).collect();
            let text = format!("{} commented: {preview}", user.profile.display_name);
            db.create_notification(&post.author_id, NotificationKind::Comment, Some(user.uid()), Some(&id), &text)?;
        }
        Ok(Some(comment))
    })?;
    let comment = comment.ok_or_else(|| ApiError::not_found("post"))?;
    Ok((StatusCode::CREATED, Json(comment)))
}

/// Comment author, post author, or an admin may delete a comment.
async fn delete_comment(
    State(state): State<Arc<SharedState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let comment = state
        .with_db(|db| db.get_comment(&id))?
        .ok_or_else(|| ApiError::not_found("comment"))?;
    let post_author = state
        .with_db(|db| db.get_post(&comment.post_id, None))?
        .map(|p| p.author_id);
    let allowed = comment.author_id == user.uid()
        || post_author.as_deref() == Some(user.uid())
        || user.is_admin;
    if !allowed {
        return Err(ApiError::forbidden("not allowed to delete this comment"));
    }
    state.with_db(|db| db.delete_comment(&id))?;
    Ok(StatusCode::NO_CONTENT)
}
