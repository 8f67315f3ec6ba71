//! Image buffer transfer
//!
//! Camera frames live in named buffers on the server. A client fetches one by
//! asking the server to pack it, then optionally tells the server to release
//! it. The packed form is the gzip stream of
//!
//! ```text
//! json([dtype, shape, order]) \0 raw-bytes
//! ```
//!
//! where `dtype` is a numpy-style type name (`"uint16"`, `"<u2"`, ...) and
//! `order` is `"C"` (row-major) or `"F"` (column-major).

use std::collections::HashMap;
use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{AppResult, ScopeError};
use crate::rpc::client::SharedClient;
use crate::rpc::wire::Kwargs;

/// Server procedure returning a packed buffer.
pub const PACK_COMMAND: &str = "_ism_buffer_utils._server_pack_ism_data";
/// Server procedure dropping one reference to a named buffer.
pub const RELEASE_COMMAND: &str = "_ism_buffer_utils._server_release_array";
/// Gzip level the server packs with.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 2;

/// Named buffers held for clients, one stack per name.
///
/// Owned by whoever creates the buffers; the entry for a name disappears with
/// its last release.
#[derive(Debug)]
pub struct BufferRegistry<T> {
    entries: Mutex<HashMap<String, Vec<T>>>,
}

impl<T> Default for BufferRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> BufferRegistry<T> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference to `buffer` under `name`.
    pub fn register(&self, name: impl Into<String>, buffer: T) {
        let name = name.into();
        debug!("Registering buffer {name}");
        self.entries.lock().entry(name).or_default().push(buffer);
    }

    /// Drop the most recent registration under `name` and hand it back.
    pub fn release(&self, name: &str) -> AppResult<T> {
        let mut entries = self.entries.lock();
        let stack = entries
            .get_mut(name)
            .ok_or_else(|| ScopeError::UnknownAttribute(format!("buffer {name}")))?;
        let buffer = stack
            .pop()
            .ok_or_else(|| ScopeError::UnknownAttribute(format!("buffer {name}")))?;
        if stack.is_empty() {
            entries.remove(name);
        }
        Ok(buffer)
    }

    /// Outstanding registrations under `name`.
    pub fn references(&self, name: &str) -> usize {
        self.entries.lock().get(name).map_or(0, Vec::len)
    }

    /// Whether `name` has any registration left.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> BufferRegistry<T> {
    /// The most recent registration under `name`.
    pub fn get(&self, name: &str) -> Option<T> {
        self.entries.lock().get(name).and_then(|s| s.last().cloned())
    }
}

/// Memory layout of a multi-dimensional buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryOrder {
    /// Last index varies fastest (`"C"`).
    #[serde(rename = "C")]
    RowMajor,
    /// First index varies fastest (`"F"`).
    #[serde(rename = "F")]
    ColumnMajor,
}

/// Element type, shape and layout of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, Vec<usize>, MemoryOrder)", into = "(String, Vec<usize>, MemoryOrder)")]
pub struct ImageDescriptor {
    /// numpy dtype name or typestr.
    pub dtype: String,
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Memory layout.
    pub order: MemoryOrder,
}

impl From<(String, Vec<usize>, MemoryOrder)> for ImageDescriptor {
    fn from((dtype, shape, order): (String, Vec<usize>, MemoryOrder)) -> Self {
        Self { dtype, shape, order }
    }
}

impl From<ImageDescriptor> for (String, Vec<usize>, MemoryOrder) {
    fn from(d: ImageDescriptor) -> Self {
        (d.dtype, d.shape, d.order)
    }
}

impl ImageDescriptor {
    /// Descriptor from its parts.
    pub fn new(dtype: impl Into<String>, shape: Vec<usize>, order: MemoryOrder) -> Self {
        Self {
            dtype: dtype.into(),
            shape,
            order,
        }
    }

    /// Bytes per element.
    pub fn item_size(&self) -> AppResult<usize> {
        item_size(&self.dtype)
            .ok_or_else(|| ScopeError::Protocol(format!("unsupported dtype {:?}", self.dtype)))
    }

    /// Number of elements.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Expected size of the raw data.
    pub fn byte_len(&self) -> AppResult<usize> {
        self.element_count()
            .checked_mul(self.item_size()?)
            .ok_or_else(|| ScopeError::Protocol(format!("shape {:?} too large", self.shape)))
    }
}

fn item_size(dtype: &str) -> Option<usize> {
    // numpy typestr: optional byte order, kind, size ("<u2", "|b1", "f8")
    let typestr = dtype.trim_start_matches(['<', '>', '|', '=']);
    let mut chars = typestr.chars();
    if let Some(kind) = chars.next() {
        if "uifb".contains(kind) {
            if let Ok(size) = chars.as_str().parse::<usize>() {
                return Some(size);
            }
        }
    }
    match dtype {
        "bool" | "int8" | "uint8" => Some(1),
        "int16" | "uint16" | "float16" => Some(2),
        "int32" | "uint32" | "float32" => Some(4),
        "int64" | "uint64" | "float64" => Some(8),
        _ => None,
    }
}

/// A buffer with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    descriptor: ImageDescriptor,
    data: Bytes,
}

impl ImageBuffer {
    /// Wrap `data`, which must be exactly as long as the descriptor says.
    pub fn new(descriptor: ImageDescriptor, data: Bytes) -> AppResult<Self> {
        let expected = descriptor.byte_len()?;
        if data.len() != expected {
            return Err(ScopeError::Protocol(format!(
                "buffer of {dtype} {shape:?} needs {expected} bytes, got {}",
                data.len(),
                dtype = descriptor.dtype,
                shape = descriptor.shape,
            )));
        }
        Ok(Self { descriptor, data })
    }

    /// Element type, shape and layout.
    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.descriptor.shape
    }

    /// Raw element bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Take the raw bytes.
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Pack at [`DEFAULT_COMPRESSION_LEVEL`].
    pub fn pack(&self) -> AppResult<Bytes> {
        self.pack_with_level(DEFAULT_COMPRESSION_LEVEL)
    }

    /// Pack with gzip level `level` (0-9).
    pub fn pack_with_level(&self, level: u32) -> AppResult<Bytes> {
        if level > 9 {
            return Err(ScopeError::Configuration(format!(
                "gzip level {level} is outside 0-9"
            )));
        }
        let header = serde_json::to_vec(&self.descriptor)?;
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(header.len() + 1 + self.data.len() / 2),
            Compression::new(level),
        );
        encoder.write_all(&header)?;
        encoder.write_all(&[0])?;
        encoder.write_all(&self.data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Decompress and parse a packed buffer.
    pub fn unpack(packed: &[u8]) -> AppResult<Self> {
        let mut raw = Vec::new();
        GzDecoder::new(packed)
            .read_to_end(&mut raw)
            .map_err(|e| ScopeError::Protocol(format!("packed buffer is not gzip data: {e}")))?;
        let raw = Bytes::from(raw);

        let header_end = raw
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ScopeError::Protocol("packed buffer has no header terminator".into()))?;
        let descriptor: ImageDescriptor = serde_json::from_slice(&raw[..header_end])
            .map_err(|e| ScopeError::Protocol(format!("bad packed buffer header: {e}")))?;
        Self::new(descriptor, raw.slice(header_end + 1..))
    }
}

/// Pulls named buffers from the server over RPC.
#[derive(Clone)]
pub struct ImageFetcher {
    client: SharedClient,
}

impl ImageFetcher {
    /// Fetcher calling through `client`.
    pub fn new(client: SharedClient) -> Self {
        Self { client }
    }

    /// Fetch buffer `name`; with `release`, drop the server's reference afterwards.
    pub async fn fetch(&self, name: &str, release: bool) -> AppResult<ImageBuffer> {
        let mut client = self.client.lock().await;
        let args = [Value::String(name.to_string())];
        let packed = client.call(PACK_COMMAND, &args, &Kwargs::new()).await?.into_binary()?;
        let image = ImageBuffer::unpack(&packed)?;
        if release {
            client.call(RELEASE_COMMAND, &args, &Kwargs::new()).await?;
        }
        debug!("Fetched {name}: {} {:?}", image.descriptor.dtype, image.shape());
        Ok(image)
    }

    /// Fetch several buffers in order, releasing each.
    pub async fn fetch_all<I, S>(&self, names: I) -> AppResult<Vec<ImageBuffer>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut images = Vec::new();
        for name in names {
            images.push(self.fetch(name.as_ref(), true).await?);
        }
        Ok(images)
    }
}

impl std::fmt::Debug for ImageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFetcher").finish_non_exhaustive()
    }
}

/// Descriptor rendered the way the server reports it, for logs and the CLI.
pub fn describe_image(image: &ImageBuffer) -> Value {
    json!({
        "dtype": image.descriptor.dtype,
        "shape": image.descriptor.shape,
        "order": image.descriptor.order,
        "bytes": image.data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::rpc::client::RpcClient;
    use crate::rpc::mock::{MockResponse, MockServer};
    use std::sync::Arc;

    fn frame() -> ImageBuffer {
        let descriptor = ImageDescriptor::new("uint16", vec![2, 3], MemoryOrder::ColumnMajor);
        ImageBuffer::new(descriptor, Bytes::from((0u8..12).collect::<Vec<_>>())).unwrap()
    }

    fn gunzip(packed: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        GzDecoder::new(packed).read_to_end(&mut raw).unwrap();
        raw
    }

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_packed_layout() {
        let packed = frame().pack().unwrap();
        let raw = gunzip(&packed);
        let header = br#"["uint16",[2,3],"F"]"#;
        assert_eq!(&raw[..header.len()], header);
        assert_eq!(raw[header.len()], 0);
        assert_eq!(raw.len(), header.len() + 1 + 12);

        assert_eq!(ImageBuffer::unpack(&packed).unwrap(), frame());
    }

    #[test]
    fn test_unpack_python_gzip_payload() {
        // gzip.compress(b'["uint8",[2],"C"]\x00\x01\x02', compresslevel=2, mtime=0)
        let packed: &[u8] = &[
            0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x8b, 0x56, 0x2a, 0xcd,
            0xcc, 0x2b, 0xb1, 0x50, 0xd2, 0x89, 0x36, 0x8a, 0xd5, 0x51, 0x72, 0x56, 0x8a, 0x65,
            0x60, 0x64, 0x02, 0x00, 0xa5, 0xd9, 0xdd, 0xf8, 0x14, 0x00, 0x00, 0x00,
        ];
        let image = ImageBuffer::unpack(packed).unwrap();
        assert_eq!(image.descriptor().dtype, "uint8");
        assert_eq!(image.shape(), &[2]);
        assert_eq!(image.descriptor().order, MemoryOrder::RowMajor);
        assert_eq!(&image.data()[..], &[1, 2]);
    }

    #[test]
    fn test_compression_levels() {
        let image = frame();
        for level in [0, 2, 9] {
            let packed = image.pack_with_level(level).unwrap();
            assert_eq!(ImageBuffer::unpack(&packed).unwrap(), image);
        }
        assert!(matches!(
            image.pack_with_level(10),
            Err(ScopeError::Configuration(_))
        ));
    }

    #[test]
    fn test_unpack_checks_length() {
        let mut raw = br#"["<u2",[4,4],"C"]"#.to_vec();
        raw.push(0);
        raw.extend_from_slice(&[0u8; 31]);
        assert!(matches!(
            ImageBuffer::unpack(&gzip(&raw)),
            Err(ScopeError::Protocol(_))
        ));

        assert!(ImageBuffer::unpack(&gzip(b"no header")).is_err());
        // uncompressed data is rejected outright
        assert!(matches!(
            ImageBuffer::unpack(b"[\"uint8\",[1],\"C\"]\x00\x07"),
            Err(ScopeError::Protocol(_))
        ));
    }

    #[test]
    fn test_item_sizes() {
        assert_eq!(item_size("uint8"), Some(1));
        assert_eq!(item_size("<u2"), Some(2));
        assert_eq!(item_size("float32"), Some(4));
        assert_eq!(item_size(">f8"), Some(8));
        assert_eq!(item_size("complex128"), None);
    }

    #[test]
    fn test_registry_release_on_last_reference() {
        let registry = BufferRegistry::new();
        registry.register("live", 1);
        registry.register("live", 2);
        assert_eq!(registry.references("live"), 2);
        assert_eq!(registry.get("live"), Some(2));

        assert_eq!(registry.release("live").unwrap(), 2);
        assert!(registry.contains("live"));
        assert_eq!(registry.release("live").unwrap(), 1);
        assert!(!registry.contains("live"));
        assert!(registry.is_empty());
        assert!(registry.release("live").is_err());
    }

    #[tokio::test]
    async fn test_fetcher_unpacks_and_releases() {
        let registry = Arc::new(BufferRegistry::new());
        registry.register("frame-1", frame());
        let server_registry = registry.clone();
        let server = MockServer::new(move |command, args, _| {
            let name = args.first().and_then(Value::as_str).unwrap_or_default();
            match command {
                PACK_COMMAND => match server_registry.get(name) {
                    Some(image) => match image.pack() {
                        Ok(packed) => MockResponse::Binary(packed),
                        Err(e) => MockResponse::Error(json!(e.to_string())),
                    },
                    None => MockResponse::Error(json!(format!("KeyError: {name}"))),
                },
                RELEASE_COMMAND => match server_registry.release(name) {
                    Ok(_) => MockResponse::Value(Value::Null),
                    Err(e) => MockResponse::Error(json!(e.to_string())),
                },
                _ => MockResponse::Error(json!("unknown")),
            }
        });
        let client = RpcClient::connect(Arc::new(server.connector()), "mock", &ClientConfig::default())
            .await
            .unwrap()
            .into_shared();
        let fetcher = ImageFetcher::new(client);

        let image = fetcher.fetch("frame-1", false).await.unwrap();
        assert_eq!(image, frame());
        assert!(registry.contains("frame-1"));

        let image = fetcher.fetch("frame-1", true).await.unwrap();
        assert_eq!(describe_image(&image)["bytes"], json!(12));
        assert!(registry.is_empty());

        assert!(matches!(
            fetcher.fetch("frame-1", true).await,
            Err(ScopeError::Remote { .. })
        ));
    }
}
