//! Anonymous reads of public S3 objects.
use crate::catalog::TileStream;
use crate::error::{Error, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use futures_util::stream::{self, StreamExt};
use regex::Regex;

#[derive(Debug, PartialEq)]
pub struct S3Object {
    pub region: String,
    pub bucket: String,
    pub key: String,
}

impl S3Object {
    /// Parse a virtual-hosted style URL such as
    /// `https://bucket.s3.us-west-2.amazonaws.com/path/to/B08.tif`.
    pub fn from_url(url: &str) -> Result<Self> {
        let re = Regex::new(
            r"^https://(?<bucket>[^./]+)\.s3\.(?<region>[^./]+)\.amazonaws\.com/(?<key>.+)$",
        )
        .expect("Regex pattern should always compile");

        let captures = re
            .captures(url)
            .ok_or_else(|| Error::NonRetryableFetch(format!("Not an S3 object URL: {url}")))?;

        let (_, [bucket, region, key]) = captures.extract();

        Ok(Self {
            region: region.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

pub async fn anon_client(region: &str) -> Client {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .no_credentials()
        .region(Region::new(region.to_string()))
        .load()
        .await;
    Client::new(&config)
}

/// Open `object` and hand its body back as a chunk stream.
pub async fn stream_object(client: &Client, object: &S3Object) -> Result<TileStream> {
    let output = client
        .get_object()
        .bucket(&object.bucket)
        .key(&object.key)
        .send()
        .await
        .map_err(classify)?;

    let chunks = stream::unfold(Some(output.body), |body: Option<ByteStream>| async move {
        let mut body = body?;
        match body.try_next().await {
            Ok(Some(bytes)) => Some((Ok(bytes), Some(body))),
            Ok(None) => None,
            // The body is unusable after a read error; end the stream after reporting it
            Err(e) => Some((Err(Error::TransientTransport(e.to_string())), None)),
        }
    });
    Ok(chunks.boxed())
}

fn classify<E>(e: SdkError<E, HttpResponse>) -> Error
where
    E: std::error::Error + 'static,
{
    let message = DisplayErrorContext(&e).to_string();
    match &e {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::TransientTransport(message)
        }
        _ => match e.raw_response().map(|r| r.status().as_u16()) {
            Some(status) if status >= 500 || status == 429 => Error::TransientTransport(message),
            _ => Error::NonRetryableFetch(message),
        },
    }
}
