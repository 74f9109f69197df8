pub mod admin;
pub mod collections;
pub mod video;

use crate::models::ErrorResponse;
use rocket::serde::json::Json;

pub type ApiResult<T> = Result<Json<T>, ErrorResponse>;

pub use admin::*;
pub use collections::*;
pub use video::*;
