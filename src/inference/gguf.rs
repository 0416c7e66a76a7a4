//! GGUF model files.
//!
//! The header is parsed once with candle's `gguf_file` reader. The tokenizer
//! and the context cap are built from its metadata, then the same content and
//! reader are handed to the runtime to load tensors.

use crate::error::{BackendError, EmberError, Result};
use candle_core::quantized::gguf_file::{Content, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub type Metadata = HashMap<String, Value>;

/// A model file whose header has been read
pub struct ModelFile {
    path: PathBuf,
    content: Content,
    reader: BufReader<File>,
}

impl ModelFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::ModelNotFound(path.to_path_buf()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let content = Content::read(&mut reader)
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            content,
            reader,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.content.metadata
    }

    #[must_use]
    pub fn tensor_count(&self) -> usize {
        self.content.tensor_infos.len()
    }

    #[must_use]
    pub fn architecture(&self) -> Option<&str> {
        get_str(self.metadata(), "general.architecture")
    }

    #[must_use]
    pub fn model_name(&self) -> Option<&str> {
        get_str(self.metadata(), "general.name")
    }

    /// Training context length declared for the architecture
    #[must_use]
    pub fn context_length(&self) -> Option<u64> {
        let arch = self.architecture()?;
        get_u64(self.metadata(), &format!("{arch}.context_length"))
    }

    /// Quantization label derived from `general.file_type`
    #[must_use]
    pub fn quantization(&self) -> Option<&'static str> {
        Some(match get_u64(self.metadata(), "general.file_type")? {
            0 => "F32",
            1 => "F16",
            2 => "Q4_0",
            3 => "Q4_1",
            7 => "Q8_0",
            8 => "Q5_0",
            9 => "Q5_1",
            10 => "Q2_K",
            11 => "Q3_K_S",
            12 => "Q3_K_M",
            13 => "Q3_K_L",
            14 => "Q4_K_S",
            15 => "Q4_K_M",
            16 => "Q5_K_S",
            17 => "Q5_K_M",
            18 => "Q6_K",
            _ => return None,
        })
    }

    /// Parsed header and the reader positioned over the same file
    #[must_use]
    pub fn into_parts(self) -> (Content, BufReader<File>) {
        (self.content, self.reader)
    }
}

#[must_use]
pub fn get_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(as_str)
}

#[must_use]
pub fn get_u64(metadata: &Metadata, key: &str) -> Option<u64> {
    metadata.get(key).and_then(as_u64)
}

#[must_use]
pub fn get_bool(metadata: &Metadata, key: &str) -> Option<bool> {
    match metadata.get(key)? {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

#[must_use]
pub fn get_array<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a [Value]> {
    match metadata.get(key)? {
        Value::Array(values) => Some(values.as_slice()),
        _ => None,
    }
}

#[must_use]
pub fn as_str(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

/// Any non-negative integer value
#[must_use]
pub fn as_u64(value: &Value) -> Option<u64> {
    match *value {
        Value::U8(v) => Some(u64::from(v)),
        Value::U16(v) => Some(u64::from(v)),
        Value::U32(v) => Some(u64::from(v)),
        Value::U64(v) => Some(v),
        Value::I8(v) => u64::try_from(v).ok(),
        Value::I16(v) => u64::try_from(v).ok(),
        Value::I32(v) => u64::try_from(v).ok(),
        Value::I64(v) => u64::try_from(v).ok(),
        _ => None,
    }
}

#[must_use]
pub fn as_i64(value: &Value) -> Option<i64> {
    match *value {
        Value::U8(v) => Some(i64::from(v)),
        Value::U16(v) => Some(i64::from(v)),
        Value::U32(v) => Some(i64::from(v)),
        Value::U64(v) => i64::try_from(v).ok(),
        Value::I8(v) => Some(i64::from(v)),
        Value::I16(v) => Some(i64::from(v)),
        Value::I32(v) => Some(i64::from(v)),
        Value::I64(v) => Some(v),
        _ => None,
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn as_f32(value: &Value) -> Option<f32> {
    match *value {
        Value::F32(v) => Some(v),
        Value::F64(v) => Some(v as f32),
        _ => None,
    }
}

fn invalid(message: impl Into<String>) -> EmberError {
    BackendError::InvalidContainer(message.into()).into()
}
