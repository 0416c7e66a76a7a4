use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Immutable description of a downloadable model artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: Cow<'static, str>,
    #[serde(default)]
    pub description: Cow<'static, str>,
    pub url: Cow<'static, str>,
    pub filename: Cow<'static, str>,
    /// Lowercase hex SHA-256 of the final file
    #[serde(default)]
    pub checksum: Option<Cow<'static, str>>,
    pub size_bytes: u64,
    #[serde(default = "default_format")]
    pub format: Cow<'static, str>,
    #[serde(default)]
    pub quantization: Cow<'static, str>,
    #[serde(default)]
    pub recommended_for_embedded: bool,
    #[serde(default)]
    pub min_ram_mb: u32,
}

fn default_format() -> Cow<'static, str> {
    Cow::Borrowed("GGUF")
}

impl ModelDescriptor {
    /// Descriptor for an artifact outside the built-in catalog
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            description: Cow::Borrowed(""),
            url: Cow::Owned(url.into()),
            filename: Cow::Owned(filename.into()),
            checksum: None,
            size_bytes,
            format: default_format(),
            quantization: Cow::Borrowed(""),
            recommended_for_embedded: false,
            min_ram_mb: 0,
        }
    }

    #[must_use]
    pub fn with_checksum(mut self, sha256: impl Into<String>) -> Self {
        self.checksum = Some(Cow::Owned(sha256.into().to_ascii_lowercase()));
        self
    }
}

pub const TINYLLAMA_1B_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("tinyllama-1.1b-chat-q4"),
    description: Cow::Borrowed("TinyLlama 1.1B Chat, fast enough for single-board computers"),
    url: Cow::Borrowed("https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf"),
    filename: Cow::Borrowed("tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf"),
    checksum: None,
    size_bytes: 668_788_096,
    format: Cow::Borrowed("GGUF"),
    quantization: Cow::Borrowed("Q4_K_M"),
    recommended_for_embedded: true,
    min_ram_mb: 1024,
};

pub const PHI2_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("phi-2-q4"),
    description: Cow::Borrowed("Microsoft Phi-2 2.7B, strong reasoning for its size"),
    url: Cow::Borrowed(
        "https://huggingface.co/TheBloke/phi-2-GGUF/resolve/main/phi-2.Q4_K_M.gguf",
    ),
    filename: Cow::Borrowed("phi-2.Q4_K_M.gguf"),
    checksum: None,
    size_bytes: 1_789_239_168,
    format: Cow::Borrowed("GGUF"),
    quantization: Cow::Borrowed("Q4_K_M"),
    recommended_for_embedded: true,
    min_ram_mb: 3072,
};

pub const MISTRAL_7B_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("mistral-7b-instruct-q4"),
    description: Cow::Borrowed("Mistral 7B Instruct v0.2, desktop-class quality"),
    url: Cow::Borrowed("https://huggingface.co/TheBloke/Mistral-7B-Instruct-v0.2-GGUF/resolve/main/mistral-7b-instruct-v0.2.Q4_K_M.gguf"),
    filename: Cow::Borrowed("mistral-7b-instruct-v0.2.Q4_K_M.gguf"),
    checksum: None,
    size_bytes: 4_368_439_584,
    format: Cow::Borrowed("GGUF"),
    quantization: Cow::Borrowed("Q4_K_M"),
    recommended_for_embedded: false,
    min_ram_mb: 6144,
};

pub const LLAMA2_7B_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("llama-2-7b-chat-q4"),
    description: Cow::Borrowed("Llama 2 7B Chat, general purpose assistant"),
    url: Cow::Borrowed("https://huggingface.co/TheBloke/Llama-2-7B-Chat-GGUF/resolve/main/llama-2-7b-chat.Q4_K_M.gguf"),
    filename: Cow::Borrowed("llama-2-7b-chat.Q4_K_M.gguf"),
    checksum: None,
    size_bytes: 4_081_004_224,
    format: Cow::Borrowed("GGUF"),
    quantization: Cow::Borrowed("Q4_K_M"),
    recommended_for_embedded: false,
    min_ram_mb: 6144,
};

/// Built-in model catalog
pub const MODELS: &[ModelDescriptor] = &[TINYLLAMA_1B_Q4, PHI2_Q4, MISTRAL_7B_Q4, LLAMA2_7B_Q4];

/// Built-in entries plus any extra descriptors from configuration
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<ModelDescriptor>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            entries: MODELS.to_vec(),
        }
    }
}

impl Catalog {
    /// Built-in catalog extended with `extra`; an extra entry replaces a built-in one of the same name
    #[must_use]
    pub fn with_extra(extra: &[ModelDescriptor]) -> Self {
        let mut catalog = Self::default();
        for descriptor in extra {
            catalog.entries.retain(|m| m.name != descriptor.name);
            catalog.entries.push(descriptor.clone());
        }
        catalog
    }

    #[must_use]
    pub fn entries(&self) -> &[ModelDescriptor] {
        &self.entries
    }

    /// Find model by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|m| m.name == name)
    }

    /// Get all model names
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.name.as_ref()).collect()
    }

    #[must_use]
    pub fn recommended_for_embedded(&self) -> Vec<&ModelDescriptor> {
        self.entries
            .iter()
            .filter(|m| m.recommended_for_embedded)
            .collect()
    }

    /// Models whose minimum RAM fits in `ram_mb`, smallest first
    #[must_use]
    pub fn fitting_ram(&self, ram_mb: u32) -> Vec<&ModelDescriptor> {
        let mut fitting: Vec<_> = self
            .entries
            .iter()
            .filter(|m| m.min_ram_mb <= ram_mb)
            .collect();
        fitting.sort_by_key(|m| m.min_ram_mb);
        fitting
    }

    /// Find closest match using Levenshtein distance
    #[must_use]
    pub fn suggest(&self, name: &str) -> Option<&str> {
        if name.is_empty() {
            return None;
        }

        self.entries
            .iter()
            .map(|m| (m.name.as_ref(), levenshtein_distance(name, &m.name)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(model_name, _)| model_name)
    }
}

/// Calculate Levenshtein distance between two strings
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s2_chars: Vec<char> = s2.chars().collect();
    let mut previous: Vec<usize> = (0..=s2_chars.len()).collect();

    for (i, c1) in s1.chars().enumerate() {
        let mut current = Vec::with_capacity(previous.len());
        current.push(i + 1);
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != *c2);
            let value = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
            current.push(value);
        }
        previous = current;
    }

    previous[s2_chars.len()]
}
