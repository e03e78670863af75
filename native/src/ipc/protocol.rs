// Render command/result records and their sequential binary encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Largest encoded Command or Result accepted by either transport.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Payload too large: {size} bytes (limit {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { size: usize },
    #[error("Truncated record: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("Invalid value {value} for {field}")]
    InvalidEnum { field: &'static str, value: u32 },
    #[error("Invalid boolean byte {value} for {field}")]
    InvalidBool { field: &'static str, value: u8 },
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Reject payloads above [`MAX_PAYLOAD_SIZE`].
pub fn check_payload_size(size: usize) -> Result<(), WireError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge { size });
    }
    Ok(())
}

/// Command id of an encoded command that may not decode fully.
pub fn peek_command_id(bytes: &[u8]) -> Option<u64> {
    let id: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(id))
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// u32-backed enums with checked decoding.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn as_u32(self) -> u32 {
                self as u32
            }
        }

        impl TryFrom<u32> for $name {
            type Error = WireError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(WireError::InvalidEnum { field: $field, value }),
                }
            }
        }
    };
}

wire_enum!(
    /// Operation requested from the worker.
    RenderCommandType, "command_type" {
        Initialize = 0,
        Render = 1,
        Resize = 2,
        Destroy = 3,
        SwitchBackend = 4,
        UpdateContent = 5,
        SetProperty = 6,
        LoadContent = 7,
        GetSystemSnapshot = 100,
        GetProcessSnapshot = 101,
    }
);

wire_enum!(
    /// Rendering backend the worker should use for a widget.
    RenderBackendType, "backend_type" {
        Skia = 0,
        Direct3D = 1,
        WebView = 2,
        Auto = 99,
    }
);

wire_enum!(
    ContentSourceType, "source_type" {
        Static = 0,
        Web = 1,
        Api = 2,
        Media = 3,
        File = 4,
        Office = 5,
        Custom = 99,
    }
);

wire_enum!(
    RenderResultStatus, "status" {
        Success = 0,
        Failure = 1,
        Pending = 2,
        BackendNotSupported = 3,
        ContentLoadError = 4,
        InvalidParameters = 5,
    }
);

wire_enum!(
    /// How `RenderResult::payload` should be interpreted.
    PayloadKind, "payload_kind" {
        None = 0,
        Text = 1,
        Json = 2,
        Binary = 3,
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl RenderRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Where a widget's content comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentParameters {
    pub source_type: ContentSourceType,
    pub source_url: String,
    pub template_data: String,
    pub refresh_interval_ms: i32,
    pub cache_enabled: bool,
    pub custom_headers: Vec<(String, String)>,
    pub parameters: Vec<(String, String)>,
}

impl Default for ContentParameters {
    fn default() -> Self {
        Self {
            source_type: ContentSourceType::Static,
            source_url: String::new(),
            template_data: String::new(),
            refresh_interval_ms: 0,
            cache_enabled: true,
            custom_headers: Vec::new(),
            parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderProperties {
    pub opacity: f32,
    pub visible: bool,
    pub click_through: bool,
    pub top_most: bool,
    pub z_order: i32,
    pub target_fps: i32,
}

impl Default for RenderProperties {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            visible: true,
            click_through: false,
            top_most: false,
            z_order: 0,
            target_fps: 60,
        }
    }
}

/// Request sent from the orchestrator to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderCommand {
    /// Caller-assigned id echoed back in the matching result.
    pub command_id: u64,
    pub command_type: RenderCommandType,
    pub widget_id: u32,
    /// Native window handle, widened to 64 bits on the wire.
    pub window_handle: u64,
    pub backend_type: RenderBackendType,
    pub bounds: RenderRect,
    pub content: ContentParameters,
    pub properties: RenderProperties,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Response sent from the worker to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    pub command_id: u64,
    pub widget_id: u32,
    pub status: RenderResultStatus,
    /// Human-readable error, empty on success.
    pub error_message: String,
    pub payload_kind: PayloadKind,
    pub payload: Vec<u8>,
    pub render_time_ms: u64,
    pub frame_count: u32,
    pub average_fps: f32,
    pub memory_usage_mb: u64,
    pub timestamp: u64,
}

impl RenderCommand {
    /// Create a command stamped with the current time.
    pub fn new(command_id: u64, command_type: RenderCommandType, widget_id: u32) -> Self {
        Self {
            command_id,
            command_type,
            widget_id,
            window_handle: 0,
            backend_type: RenderBackendType::Auto,
            bounds: RenderRect::default(),
            content: ContentParameters::default(),
            properties: RenderProperties::default(),
            timestamp: now_millis(),
        }
    }

    pub fn with_bounds(mut self, bounds: RenderRect) -> Self {
        self.bounds = bounds;
        self
    }

    /// Encode the command, rejecting it if it exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut w = WireWriter::default();
        w.put_u64(self.command_id);
        w.put_u32(self.command_type.as_u32());
        w.put_u32(self.widget_id);
        w.put_u64(self.window_handle);
        w.put_u32(self.backend_type.as_u32());
        w.put_rect(&self.bounds);

        let c = &self.content;
        w.put_u32(c.source_type.as_u32());
        w.put_str(&c.source_url);
        w.put_str(&c.template_data);
        w.put_i32(c.refresh_interval_ms);
        w.put_bool(c.cache_enabled);
        w.put_pairs(&c.custom_headers);
        w.put_pairs(&c.parameters);

        let p = &self.properties;
        w.put_f32(p.opacity);
        w.put_bool(p.visible);
        w.put_bool(p.click_through);
        w.put_bool(p.top_most);
        w.put_i32(p.z_order);
        w.put_i32(p.target_fps);

        w.put_u64(self.timestamp);
        w.finish()
    }

    /// Decode a command, requiring the buffer to hold exactly one record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        check_payload_size(bytes.len())?;
        let mut r = WireReader::new(bytes);

        let command_id = r.get_u64()?;
        let command_type = RenderCommandType::try_from(r.get_u32()?)?;
        let widget_id = r.get_u32()?;
        let window_handle = r.get_u64()?;
        let backend_type = RenderBackendType::try_from(r.get_u32()?)?;
        let bounds = r.get_rect()?;

        let content = ContentParameters {
            source_type: ContentSourceType::try_from(r.get_u32()?)?,
            source_url: r.get_str("source_url")?,
            template_data: r.get_str("template_data")?,
            refresh_interval_ms: r.get_i32()?,
            cache_enabled: r.get_bool("cache_enabled")?,
            custom_headers: r.get_pairs("custom_headers")?,
            parameters: r.get_pairs("parameters")?,
        };

        let properties = RenderProperties {
            opacity: r.get_f32()?,
            visible: r.get_bool("visible")?,
            click_through: r.get_bool("click_through")?,
            top_most: r.get_bool("top_most")?,
            z_order: r.get_i32()?,
            target_fps: r.get_i32()?,
        };

        let timestamp = r.get_u64()?;
        r.finish()?;

        Ok(Self {
            command_id,
            command_type,
            widget_id,
            window_handle,
            backend_type,
            bounds,
            content,
            properties,
            timestamp,
        })
    }
}

impl RenderResult {
    /// Successful result for `command`.
    pub fn success(command: &RenderCommand) -> Self {
        Self::with_status(
            command.command_id,
            command.widget_id,
            RenderResultStatus::Success,
            String::new(),
        )
    }

    /// Failed result carrying `message`.
    pub fn failure(command_id: u64, widget_id: u32, message: impl Into<String>) -> Self {
        Self::with_status(
            command_id,
            widget_id,
            RenderResultStatus::Failure,
            message.into(),
        )
    }

    pub fn with_status(
        command_id: u64,
        widget_id: u32,
        status: RenderResultStatus,
        error_message: String,
    ) -> Self {
        Self {
            command_id,
            widget_id,
            status,
            error_message,
            payload_kind: PayloadKind::None,
            payload: Vec::new(),
            render_time_ms: 0,
            frame_count: 0,
            average_fps: 0.0,
            memory_usage_mb: 0,
            timestamp: now_millis(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RenderResultStatus::Success
    }

    /// Attach a JSON-serialized payload.
    pub fn with_json_payload<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_vec(value)?;
        self.payload_kind = PayloadKind::Json;
        Ok(self)
    }

    /// Parse a JSON payload, if the result carries one.
    pub fn json_payload<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        if self.payload_kind != PayloadKind::Json {
            return None;
        }
        Some(serde_json::from_slice(&self.payload))
    }

    /// Encode the result, rejecting it if it exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut w = WireWriter::default();
        w.put_u64(self.command_id);
        w.put_u32(self.widget_id);
        w.put_u32(self.status.as_u32());
        w.put_str(&self.error_message);
        w.put_u32(self.payload_kind.as_u32());
        w.put_bytes(&self.payload);
        w.put_u64(self.render_time_ms);
        w.put_u32(self.frame_count);
        w.put_f32(self.average_fps);
        w.put_u64(self.memory_usage_mb);
        w.put_u64(self.timestamp);
        w.finish()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        check_payload_size(bytes.len())?;
        let mut r = WireReader::new(bytes);

        let result = Self {
            command_id: r.get_u64()?,
            widget_id: r.get_u32()?,
            status: RenderResultStatus::try_from(r.get_u32()?)?,
            error_message: r.get_str("error_message")?,
            payload_kind: PayloadKind::try_from(r.get_u32()?)?,
            payload: r.get_bytes()?.to_vec(),
            render_time_ms: r.get_u64()?,
            frame_count: r.get_u32()?,
            average_fps: r.get_f32()?,
            memory_usage_mb: r.get_u64()?,
            timestamp: r.get_u64()?,
        };
        r.finish()?;
        Ok(result)
    }
}

#[derive(Default)]
struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        // Lengths above u32::MAX cannot pass the size check in finish().
        self.put_u32(bytes.len().min(u32::MAX as usize) as u32);
        self.buf.extend_from_slice(bytes);
    }

    fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    fn put_pairs(&mut self, pairs: &[(String, String)]) {
        self.put_u32(pairs.len() as u32);
        for (key, value) in pairs {
            self.put_str(key);
            self.put_str(value);
        }
    }

    fn put_rect(&mut self, rect: &RenderRect) {
        self.put_i32(rect.x);
        self.put_i32(rect.y);
        self.put_i32(rect.width);
        self.put_i32(rect.height);
    }

    fn finish(self) -> Result<Vec<u8>, WireError> {
        check_payload_size(self.buf.len())?;
        Ok(self.buf)
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(WireError::Truncated {
                needed: len,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn get_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    fn get_f32(&mut self) -> Result<f32, WireError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    fn get_bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(WireError::InvalidBool { field, value }),
        }
    }

    fn get_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    fn get_str(&mut self, field: &'static str) -> Result<String, WireError> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8(field))
    }

    fn get_pairs(&mut self, field: &'static str) -> Result<Vec<(String, String)>, WireError> {
        let count = self.get_u32()? as usize;
        // Each pair needs at least two length prefixes.
        let remaining = self.buf.len() - self.pos;
        if count.saturating_mul(8) > remaining {
            return Err(WireError::Truncated {
                needed: count.saturating_mul(8),
                remaining,
            });
        }
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.get_str(field)?;
            let value = self.get_str(field)?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    fn get_rect(&mut self) -> Result<RenderRect, WireError> {
        Ok(RenderRect {
            x: self.get_i32()?,
            y: self.get_i32()?,
            width: self.get_i32()?,
            height: self.get_i32()?,
        })
    }

    fn finish(self) -> Result<(), WireError> {
        let trailing = self.buf.len() - self.pos;
        if trailing > 0 {
            return Err(WireError::TrailingBytes(trailing));
        }
        Ok(())
    }
}
