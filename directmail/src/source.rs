//! Message bodies that can be transmitted to more than one destination.
//!
//! Each destination opens the source once per attempt that reaches DATA. A
//! source that can only be read once ([`BufferedSource`]) is materialised into
//! an immutable [`Bytes`] buffer on the first open and replayed afterwards; a
//! [`ReopenableSource`] produces a fresh reader every time.

use std::{future::Future, io};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Mutex, OnceCell},
};

use crate::error::SourceError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// What one `open` produced.
///
/// A read failure does not discard what was read before it: `bytes` holds
/// everything up to the failure and `error` says why it stopped.
#[derive(Debug, Clone, Default)]
pub struct SourceBody {
    pub bytes: Bytes,
    pub error: Option<SourceError>,
}

impl SourceBody {
    #[must_use]
    pub const fn complete(bytes: Bytes) -> Self {
        Self { bytes, error: None }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Producer of the raw message bytes.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn open(&self) -> SourceBody;
}

/// Reads `reader` to the end, keeping the bytes read before any failure.
async fn read_body(mut reader: impl AsyncRead + Unpin) -> SourceBody {
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => return SourceBody::complete(buf.freeze()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                return SourceBody {
                    bytes: buf.freeze(),
                    error: Some(e.into()),
                };
            }
        }
    }
}

/// A single-use reader, read in full the first time any destination opens it.
pub struct BufferedSource {
    reader: Mutex<Option<BoxedReader>>,
    body: OnceCell<SourceBody>,
}

impl BufferedSource {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            body: OnceCell::new(),
        }
    }
}

#[async_trait]
impl MessageSource for BufferedSource {
    async fn open(&self) -> SourceBody {
        self.body
            .get_or_init(|| async {
                let reader = self.reader.lock().await.take();
                match reader {
                    Some(reader) => read_body(reader).await,
                    None => SourceBody::default(),
                }
            })
            .await
            .clone()
    }
}

type OpenFn = dyn Fn() -> BoxFuture<'static, io::Result<BoxedReader>> + Send + Sync;

/// A factory producing a fresh reader for every open.
pub struct ReopenableSource {
    open: Box<OpenFn>,
}

impl ReopenableSource {
    /// `open` is called once per destination attempt that transmits the body.
    pub fn new<F, Fut, R>(open: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<R>> + Send + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            open: Box::new(move || -> BoxFuture<'static, io::Result<BoxedReader>> {
                let fut = open();
                Box::pin(async move { fut.await.map(|reader| Box::new(reader) as BoxedReader) })
            }),
        }
    }
}

#[async_trait]
impl MessageSource for ReopenableSource {
    async fn open(&self) -> SourceBody {
        match (self.open)().await {
            Ok(reader) => read_body(reader).await,
            Err(e) => SourceBody {
                bytes: Bytes::new(),
                error: Some(e.into()),
            },
        }
    }
}

#[async_trait]
impl MessageSource for Bytes {
    async fn open(&self) -> SourceBody {
        SourceBody::complete(self.clone())
    }
}

#[async_trait]
impl MessageSource for &'static [u8] {
    async fn open(&self) -> SourceBody {
        SourceBody::complete(Bytes::from_static(*self))
    }
}

#[async_trait]
impl MessageSource for &'static str {
    async fn open(&self) -> SourceBody {
        SourceBody::complete(Bytes::from_static((*self).as_bytes()))
    }
}

#[async_trait]
impl MessageSource for Vec<u8> {
    async fn open(&self) -> SourceBody {
        SourceBody::complete(Bytes::copy_from_slice(self))
    }
}

#[async_trait]
impl MessageSource for String {
    async fn open(&self) -> SourceBody {
        SourceBody::complete(Bytes::copy_from_slice(self.as_bytes()))
    }
}
