use std::time::Duration;

use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use serde::Serialize;

use crate::{Error, Result, StoreConfig};

/// Signed URLs expire after an hour; long enough for any single download.
const SIGNED_URL_EXPIRY: Duration = Duration::from_secs(3600);

/// Metadata returned by a HEAD request.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
	pub size: Option<u64>,
	pub content_type: Option<String>,
}

/// One entry of a bucket listing.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntry {
	pub key: String,
	pub size: Option<u64>,
	pub last_modified: Option<String>,
}

/// Thin client for the S3-compatible object store.
///
/// Issues presigned GET URLs and HEAD metadata via the AWS SDK; the actual
/// byte streams are plain HTTP GETs against the signed URL so the download
/// path needs no store credentials.
#[derive(Clone)]
pub struct ObjectStore {
	client: aws_sdk_s3::Client,
	http: reqwest::Client,
	bucket: String,
}

impl ObjectStore {
	pub async fn connect(config: &StoreConfig) -> Result<Self> {
		let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
		if let Some(region) = &config.region {
			loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
		}
		if let Some(endpoint) = &config.endpoint {
			loader = loader.endpoint_url(endpoint.as_str());
		}
		let base = loader.load().await;

		let mut builder = aws_sdk_s3::config::Builder::from(&base);
		if config.endpoint.is_some() {
			// S3-compatible stores rarely support virtual-hosted addressing.
			builder = builder.force_path_style(true);
		}

		let http = reqwest::Client::builder()
			.user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
			.build()
			.map_err(|err| Error::SourceUnavailable(err.to_string()))?;

		Ok(Self {
			client: aws_sdk_s3::Client::from_conf(builder.build()),
			http,
			bucket: config.bucket.clone(),
		})
	}

	/// HEAD the object, returning its size and content type.
	pub async fn head(&self, key: &str) -> Result<ObjectMeta> {
		let head = self
			.client
			.head_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(map_sdk)?;

		Ok(ObjectMeta {
			size: head.content_length().and_then(|len| u64::try_from(len).ok()),
			content_type: head.content_type().map(str::to_string),
		})
	}

	/// Issue a presigned GET URL for the object.
	pub async fn signed_url(&self, key: &str) -> Result<String> {
		let presigning = PresigningConfig::expires_in(SIGNED_URL_EXPIRY)
			.map_err(|err| Error::SourceUnavailable(err.to_string()))?;

		let request = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.presigned(presigning)
			.await
			.map_err(map_sdk)?;

		Ok(request.uri().to_string())
	}

	/// Open an HTTP byte stream against a signed URL, optionally resuming
	/// from a byte offset. Callers must check for 206 to learn whether the
	/// server honored the range.
	pub async fn fetch(&self, url: &str, offset: u64) -> Result<reqwest::Response> {
		let mut request = self.http.get(url);
		if offset > 0 {
			request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
		}

		let response = request.send().await?;

		match response.status().as_u16() {
			200 | 206 => Ok(response),
			401 | 403 => Err(Error::Credentials),
			404 => Err(Error::NotFound),
			status => Err(Error::SourceUnavailable(format!("unexpected status {status}"))),
		}
	}

	/// List reviewable objects under an optional prefix.
	pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectEntry>> {
		let mut entries = Vec::new();
		let mut continuation: Option<String> = None;

		loop {
			let mut request = self.client.list_objects_v2().bucket(&self.bucket);
			if let Some(prefix) = prefix {
				request = request.prefix(prefix);
			}
			if let Some(token) = continuation.take() {
				request = request.continuation_token(token);
			}

			let page = request.send().await.map_err(map_sdk)?;

			for object in page.contents() {
				let Some(key) = object.key() else { continue };
				entries.push(ObjectEntry {
					key: key.to_string(),
					size: object.size().and_then(|len| u64::try_from(len).ok()),
					last_modified: object
						.last_modified()
						.and_then(|t| t.fmt(aws_sdk_s3::primitives::DateTimeFormat::DateTime).ok()),
				});
			}

			match page.next_continuation_token() {
				Some(token) => continuation = Some(token.to_string()),
				None => break,
			}
		}

		Ok(entries)
	}

	pub fn bucket(&self) -> &str {
		&self.bucket
	}
}

fn map_sdk<E>(err: SdkError<E, aws_sdk_s3::config::http::HttpResponse>) -> Error
where
	E: std::error::Error + Send + Sync + 'static,
{
	let status = match &err {
		SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
		SdkError::ResponseError(ctx) => Some(ctx.raw().status().as_u16()),
		_ => None,
	};

	match status {
		Some(401) | Some(403) => Error::Credentials,
		Some(404) => Error::NotFound,
		_ => Error::SourceUnavailable(format!("{}", DisplayErrorContext(err))),
	}
}
