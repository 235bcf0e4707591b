/// Feature extractors the library knows how to fetch and feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinExtractor {
    /// MobileNet v2 (ONNX model zoo, opset 12)
    ///
    /// Characteristics:
    /// - Input: 224x224 RGB, ImageNet mean/std normalization, NCHW
    /// - Embedding size: 1000
    /// - Size: ~14MB
    MobileNetV2,
}

/// How an extractor expects its input and what it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorCharacteristics {
    /// Square input edge in pixels
    pub input_size: u32,
    /// Per-channel mean subtracted after scaling pixels to `[0, 1]`
    pub channel_mean: [f32; 3],
    /// Per-channel standard deviation used after mean subtraction
    pub channel_std: [f32; 3],
    /// Length of the flattened output vector, when known ahead of loading
    pub embedding_size: Option<usize>,
    /// L2-normalize the flattened output
    pub normalize: bool,
    /// Approximate size of the model file
    pub model_size_mb: usize,
}

impl Default for ExtractorCharacteristics {
    fn default() -> Self {
        Self {
            input_size: 224,
            channel_mean: [0.485, 0.456, 0.406],
            channel_std: [0.229, 0.224, 0.225],
            embedding_size: None,
            normalize: true,
            model_size_mb: 0,
        }
    }
}

/// Where to fetch a model file and, optionally, the digest it must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub model_url: String,
    /// Pinned SHA-256 (lowercase hex). When absent, the digest recorded at
    /// download time is used for later verification.
    pub model_hash: Option<String>,
}

impl BuiltinExtractor {
    pub fn characteristics(&self) -> ExtractorCharacteristics {
        match self {
            Self::MobileNetV2 => ExtractorCharacteristics {
                embedding_size: Some(1000),
                model_size_mb: 14,
                ..ExtractorCharacteristics::default()
            },
        }
    }

    pub fn get_model_info(&self) -> ModelInfo {
        match self {
            Self::MobileNetV2 => ModelInfo {
                name: "mobilenet-v2".to_string(),
                model_url: "https://github.com/onnx/models/raw/main/validated/vision/classification/mobilenet/model/mobilenetv2-12.onnx".to_string(),
                model_hash: None,
            },
        }
    }
}
