//! S3 compatible object store backend.
//!
//! Speaks the plain S3 REST dialect (path style addressing) so it also
//! works against self-hosted endpoints. Requests are signed with AWS
//! signature v4 when credentials are configured and sent anonymously
//! otherwise. Configuration comes from the environment:
//! `TESSERA_S3_ENDPOINT`, `AWS_REGION`/`AWS_DEFAULT_REGION`,
//! `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`.

use std::env;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use http::{Request, StatusCode, Uri};
use hyper::Body;
use lazy_static::lazy_static;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

use crate::digest::Digest;
use crate::error::StoreError;
use crate::tools::http::SimpleHttp;
use crate::tools::runtime;
use crate::tools::time::{epoch_i64, format_amz_date};

use super::Backend;

const MAX_TRIES: usize = 3;

// unreserved characters stay, everything else is percent encoded
const STRICT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

lazy_static! {
    static ref KEY_RE: Regex = Regex::new("<Key>([^<]+)</Key>").unwrap();
    static ref COMMON_PREFIX_RE: Regex =
        Regex::new("<CommonPrefixes>\\s*<Prefix>([^<]+)</Prefix>").unwrap();
    static ref CONTINUATION_RE: Regex =
        Regex::new("<NextContinuationToken>([^<]+)</NextContinuationToken>").unwrap();
}

struct Credentials {
    access_key: String,
    secret_key: String,
}

pub struct S3Backend {
    client: SimpleHttp,
    scheme: String,
    authority: String,
    bucket: String,
    root: String,
    region: String,
    credentials: Option<Credentials>,
}

impl S3Backend {
    pub fn new(bucket: &str, root: &str) -> Result<Self, Error> {
        let region = env::var("AWS_REGION")
            .or_else(|_| env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| "us-east-1".to_string());
        let endpoint = env::var("TESSERA_S3_ENDPOINT")
            .unwrap_or_else(|_| format!("https://s3.{}.amazonaws.com", region));

        let uri: Uri = endpoint
            .parse()
            .map_err(|err| format_err!("invalid s3 endpoint '{}' - {}", endpoint, err))?;
        let scheme = uri.scheme_str().unwrap_or("https").to_string();
        let authority = match uri.authority() {
            Some(authority) => authority.to_string(),
            None => bail!("missing host in s3 endpoint '{}'", endpoint),
        };

        let credentials = match (
            env::var("AWS_ACCESS_KEY_ID"),
            env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            (Ok(access_key), Ok(secret_key)) => Some(Credentials {
                access_key,
                secret_key,
            }),
            _ => None,
        };

        Ok(S3Backend {
            client: SimpleHttp::new()?,
            scheme,
            authority,
            bucket: bucket.to_string(),
            root: root.trim_matches('/').to_string(),
            region,
            credentials,
        })
    }

    /// Bucket-relative object key for a store key.
    fn object_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else if key.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn encode_component(component: &str) -> String {
        percent_encode(component.as_bytes(), STRICT_ENCODE_SET).to_string()
    }

    fn uri_path(&self, object_key: &str) -> String {
        let mut path = format!("/{}", Self::encode_component(&self.bucket));
        for segment in object_key.split('/').filter(|segment| !segment.is_empty()) {
            path.push('/');
            path.push_str(&Self::encode_component(segment));
        }
        path
    }

    fn canonical_query(query: &[(String, String)]) -> String {
        let mut pairs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", Self::encode_component(k), Self::encode_component(v)))
            .collect();
        pairs.sort();
        pairs.join("&")
    }

    fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
        let pkey = PKey::hmac(key)?;
        let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    /// AWS signature v4 authorization header.
    fn authorization(
        &self,
        credentials: &Credentials,
        method: &str,
        uri_path: &str,
        canonical_query: &str,
        payload_hash: &str,
        stamp: &str,
        date: &str,
    ) -> Result<String, Error> {
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            self.authority, payload_hash, stamp
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, uri_path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            stamp,
            scope,
            Digest::compute(canonical_request.as_bytes()).to_hex()
        );

        let secret = format!("AWS4{}", credentials.secret_key);
        let mut key = Self::hmac_sha256(secret.as_bytes(), date.as_bytes())?;
        key = Self::hmac_sha256(&key, self.region.as_bytes())?;
        key = Self::hmac_sha256(&key, b"s3")?;
        key = Self::hmac_sha256(&key, b"aws4_request")?;
        let signature = hex::encode(Self::hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            credentials.access_key, scope, signed_headers, signature
        ))
    }

    /// One signed round-trip, with bounded retries on transient server
    /// errors.
    fn request(
        &self,
        method: &str,
        object_key: &str,
        query: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<(StatusCode, Bytes), Error> {
        let uri_path = self.uri_path(object_key);
        let canonical_query = Self::canonical_query(query);
        let payload = body.unwrap_or(&[]);
        let payload_hash = Digest::compute(payload).to_hex();

        let uri = if canonical_query.is_empty() {
            format!("{}://{}{}", self.scheme, self.authority, uri_path)
        } else {
            format!(
                "{}://{}{}?{}",
                self.scheme, self.authority, uri_path, canonical_query
            )
        };

        let mut tries = 0;
        loop {
            tries += 1;

            let (stamp, date) = format_amz_date(epoch_i64())?;
            let mut builder = Request::builder()
                .method(method)
                .uri(&uri)
                .header("x-amz-date", &stamp)
                .header("x-amz-content-sha256", &payload_hash);
            if let Some(ref credentials) = self.credentials {
                let authorization = self.authorization(
                    credentials,
                    method,
                    &uri_path,
                    &canonical_query,
                    &payload_hash,
                    &stamp,
                    &date,
                )?;
                builder = builder.header(http::header::AUTHORIZATION, authorization);
            }
            let request = builder.body(Body::from(payload.to_vec()))?;

            let result = runtime::block_on(async {
                let response = self.client.request(request).await?;
                let status = response.status();
                let data = hyper::body::to_bytes(response.into_body()).await?;
                Ok::<_, Error>((status, data))
            });

            match result {
                Ok((status, _)) if status.is_server_error() && tries < MAX_TRIES => {
                    log::warn!("s3 {} {} returned {}, retrying", method, uri_path, status);
                }
                Ok(response) => return Ok(response),
                Err(_) if tries < MAX_TRIES => {
                    log::warn!("s3 {} {} failed, retrying", method, uri_path);
                }
                Err(err) => return Err(err),
            }
            std::thread::sleep(Duration::from_millis(100 * tries as u64));
        }
    }

    /// Enumerate object keys (and, with a delimiter, common prefixes)
    /// below `object_prefix`, following continuation tokens.
    fn list(
        &self,
        object_prefix: &str,
        delimited: bool,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query: Vec<(String, String)> = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), object_prefix.to_string()),
            ];
            if delimited {
                query.push(("delimiter".to_string(), "/".to_string()));
            }
            if let Some(ref token) = continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let (status, data) = self.request("GET", "", &query, None)?;
            if status != StatusCode::OK {
                bail!("s3 list of '{}' failed with status {}", object_prefix, status);
            }

            let text = String::from_utf8_lossy(&data);
            for capture in KEY_RE.captures_iter(&text) {
                keys.push(capture[1].to_string());
            }
            for capture in COMMON_PREFIX_RE.captures_iter(&text) {
                prefixes.push(capture[1].to_string());
            }

            match CONTINUATION_RE.captures(&text) {
                Some(capture) => continuation = Some(capture[1].to_string()),
                None => break,
            }
        }

        Ok((keys, prefixes))
    }

    fn list_scope(&self, prefix: &str) -> String {
        let object_prefix = self.object_key(prefix);
        if object_prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", object_prefix)
        }
    }
}

impl Backend for S3Backend {
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        let (status, data) = self.request("GET", &self.object_key(key), &[], None)?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(key.to_string()).into());
        }
        if !status.is_success() {
            bail!("s3 get of '{}' failed with status {}", key, status);
        }
        Ok(data.to_vec())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        let (status, _) = self.request("PUT", &self.object_key(key), &[], Some(data))?;
        if !status.is_success() {
            bail!("s3 put of '{}' failed with status {}", key, status);
        }
        Ok(())
    }

    fn rm(&self, key: &str, recursive: bool) -> Result<(), Error> {
        if recursive {
            let (keys, _) = self.list(&self.list_scope(key), false)?;
            if keys.is_empty() {
                return Err(StoreError::NotFound(key.to_string()).into());
            }
            for object_key in keys {
                let (status, _) = self.request("DELETE", &object_key, &[], None)?;
                if !status.is_success() && status != StatusCode::NOT_FOUND {
                    bail!("s3 delete of '{}' failed with status {}", object_key, status);
                }
            }
            return Ok(());
        }

        // S3 deletes are idempotent; probe first to honor rm semantics
        if !self.exists(key)? {
            return Err(StoreError::NotFound(key.to_string()).into());
        }
        let (status, _) = self.request("DELETE", &self.object_key(key), &[], None)?;
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            bail!("s3 delete of '{}' failed with status {}", key, status);
        }
        Ok(())
    }

    fn ls(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let scope = self.list_scope(prefix);
        let (keys, prefixes) = self.list(&scope, true)?;

        let mut names = Vec::new();
        for key in keys {
            if let Some(name) = key.strip_prefix(&scope) {
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        for common in prefixes {
            if let Some(name) = common.strip_prefix(&scope) {
                let name = name.trim_end_matches('/');
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn walk(&self, prefix: &str, max_depth: usize) -> Result<Vec<String>, Error> {
        let scope = self.list_scope(prefix);
        let (keys, _) = self.list(&scope, false)?;

        let mut paths = Vec::new();
        for key in keys {
            if let Some(rel) = key.strip_prefix(&scope) {
                if !rel.is_empty() && rel.split('/').count() <= max_depth {
                    paths.push(rel.to_string());
                }
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn exists(&self, key: &str) -> Result<bool, Error> {
        let (status, _) = self.request("HEAD", &self.object_key(key), &[], None)?;
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        bail!("s3 head of '{}' failed with status {}", key, status);
    }
}
