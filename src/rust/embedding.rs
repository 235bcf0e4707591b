use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use log::{debug, info};
use ndarray::{Array1, Array4};
use ort::session::Session;
use ort::value::Tensor;

use crate::error::EmbeddingError;
use crate::model_manager::ModelManager;
use crate::models::{BuiltinExtractor, ExtractorCharacteristics};
use crate::runtime::{create_session_builder, RuntimeConfig};
use crate::utils::normalize_vector;

/// A fixed-length feature vector produced by an [`EmbeddingProvider`].
pub type Embedding = Array1<f32>;

/// An encoded image as received from an upload or a capture source.
///
/// The bytes are opaque to the store; only the embedding provider decodes them.
/// Cloning is cheap.
#[derive(Clone, PartialEq, Eq)]
pub struct RawImage {
    bytes: Arc<[u8]>,
    media_type: Option<String>,
}

impl RawImage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            bytes: Arc::from(bytes),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Reads a file and guesses its media type from the extension.
    ///
    /// Unrecognized extensions are typed `application/octet-stream` and so
    /// are skipped by batch ingestion.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let image = Self::new(bytes);
        Ok(match ImageFormat::from_path(path) {
            Ok(format) => image.with_media_type(format.to_mime_type()),
            Err(_) => image.with_media_type("application/octet-stream"),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    /// False only when a media type is known and it is not `image/*`.
    pub fn is_image(&self) -> bool {
        self.media_type
            .as_deref()
            .map_or(true, |media_type| media_type.starts_with("image/"))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawImage")
            .field("len", &self.bytes.len())
            .field("media_type", &self.media_type)
            .finish()
    }
}

/// Converts a decoded image into a fixed-length embedding.
///
/// Implementations must keep their output length constant for their whole
/// lifetime. Loading a different extractor means constructing a new provider.
pub trait EmbeddingProvider: Send + Sync {
    /// Whether the extractor has finished loading.
    fn ready(&self) -> bool;

    /// Extracts an embedding from an encoded image.
    ///
    /// # Errors
    /// - `NotReady` if called before loading completes
    /// - `ExtractionError` if the image is malformed or the extractor fails
    fn embed(&self, image: &RawImage) -> Result<Embedding, EmbeddingError>;

    /// Output length, if known without embedding anything.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Image feature extractor running an ONNX model.
///
/// The model must take a single `[1, 3, H, W]` float input. Its first output is
/// flattened into the embedding, so both pooled `[1, D]` vectors and spatial
/// `[1, h, w, c]` activations work.
#[derive(Debug)]
pub struct OnnxImageEmbedder {
    session: Session,
    input_name: String,
    characteristics: ExtractorCharacteristics,
    dimension: usize,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<OnnxImageEmbedder>();
    }
};

impl OnnxImageEmbedder {
    /// Loads a built-in extractor that has already been downloaded.
    pub fn from_builtin(
        model: BuiltinExtractor,
        manager: &ModelManager,
        config: &RuntimeConfig,
    ) -> Result<Self, EmbeddingError> {
        let info = model.get_model_info();
        if !manager.is_model_downloaded(&info) {
            return Err(EmbeddingError::LoadError(format!(
                "Model '{:?}' is not downloaded. Please download it first using ModelManager::download_model()",
                model
            )));
        }
        Self::from_file(manager.get_model_path(&info), model.characteristics(), config)
    }

    /// Loads an ONNX extractor from disk and probes its output length.
    pub fn from_file(
        model_path: impl AsRef<Path>,
        characteristics: ExtractorCharacteristics,
        config: &RuntimeConfig,
    ) -> Result<Self, EmbeddingError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(EmbeddingError::LoadError(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }

        let session = create_session_builder(config)?.commit_from_file(model_path)?;
        let input_name = Self::validate_model(&session)?;
        info!("Extractor loaded from {}", model_path.display());

        let mut embedder = Self {
            session,
            input_name,
            characteristics,
            dimension: 0,
        };

        // Infer embedding size by running a blank frame
        let size = embedder.characteristics.input_size;
        let probe = DynamicImage::new_rgb8(size, size);
        let embedding = embedder.embed_image(&probe)?;
        if let Some(expected) = embedder.characteristics.embedding_size {
            if expected != embedding.len() {
                return Err(EmbeddingError::LoadError(format!(
                    "Extractor produced {} values, expected {}",
                    embedding.len(),
                    expected
                )));
            }
        }
        embedder.dimension = embedding.len();
        info!("Inferred embedding size from model: {}", embedder.dimension);

        Ok(embedder)
    }

    pub fn characteristics(&self) -> &ExtractorCharacteristics {
        &self.characteristics
    }

    /// Returns the name of the image input.
    fn validate_model(session: &Session) -> Result<String, EmbeddingError> {
        let input = session
            .inputs
            .first()
            .ok_or_else(|| EmbeddingError::LoadError("Model has no inputs".to_string()))?;
        if session.outputs.is_empty() {
            return Err(EmbeddingError::LoadError(
                "Model must have at least 1 output for embeddings".to_string(),
            ));
        }
        Ok(input.name.clone())
    }

    fn embed_image(&self, image: &DynamicImage) -> Result<Embedding, EmbeddingError> {
        let input = image_to_tensor(image, &self.characteristics);
        let input_dyn = input.into_dyn();
        let pixels = input_dyn.as_standard_layout();

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            self.input_name.as_str(),
            Tensor::from_array(&pixels).map_err(|e| {
                EmbeddingError::ExtractionError(format!("Failed to create input tensor: {}", e))
            })?,
        );

        let outputs = self
            .session
            .run(input_tensors)
            .map_err(|e| EmbeddingError::ExtractionError(format!("Failed to run model: {}", e)))?;
        let output_tensor = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            EmbeddingError::ExtractionError(format!("Failed to extract output tensor: {}", e))
        })?;
        debug!("Extractor output shape: {:?}", output_tensor.shape());

        let embedding = Array1::from_iter(output_tensor.iter().copied());
        if self.characteristics.normalize {
            Ok(normalize_vector(&embedding))
        } else {
            Ok(embedding)
        }
    }
}

impl EmbeddingProvider for OnnxImageEmbedder {
    fn ready(&self) -> bool {
        true
    }

    fn embed(&self, image: &RawImage) -> Result<Embedding, EmbeddingError> {
        let decoded = decode_image(image)?;
        let embedding = self.embed_image(&decoded)?;
        if embedding.len() != self.dimension {
            return Err(EmbeddingError::ExtractionError(format!(
                "Extractor produced {} values, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(embedding)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }
}

pub(crate) fn decode_image(image: &RawImage) -> Result<DynamicImage, EmbeddingError> {
    if image.is_empty() {
        return Err(EmbeddingError::ExtractionError("Image is empty".to_string()));
    }
    image::load_from_memory(image.bytes())
        .map_err(|e| EmbeddingError::ExtractionError(format!("Failed to decode image: {}", e)))
}

/// Resizes to the extractor's input edge and lays pixels out as normalized NCHW.
pub(crate) fn image_to_tensor(
    image: &DynamicImage,
    characteristics: &ExtractorCharacteristics,
) -> Array4<f32> {
    let size = characteristics.input_size;
    let rgb = image
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            tensor[[0, channel, y as usize, x as usize]] = (value
                - characteristics.channel_mean[channel])
                / characteristics.channel_std[channel];
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn encoded_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_media_type_filter() {
        assert!(RawImage::new(vec![1, 2]).is_image());
        assert!(RawImage::new(vec![1]).with_media_type("image/png").is_image());
        assert!(!RawImage::new(vec![1]).with_media_type("text/plain").is_image());
    }

    #[test]
    fn test_from_path_guesses_media_type() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("white.png");
        fs::write(&path, encoded_png(2, 2, [255, 255, 255]))?;
        let image = RawImage::from_path(&path)?;
        assert_eq!(image.media_type(), Some("image/png"));

        let notes = dir.path().join("notes.txt");
        fs::write(&notes, b"not an image")?;
        assert!(!RawImage::from_path(&notes)?.is_image());
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode_image(&RawImage::new(vec![0u8, 1, 2, 3]));
        assert!(matches!(result, Err(EmbeddingError::ExtractionError(_))));
        let result = decode_image(&RawImage::new(Vec::new()));
        assert!(matches!(result, Err(EmbeddingError::ExtractionError(_))));
    }

    #[test]
    fn test_tensor_layout_and_normalization() {
        let raw = RawImage::new(encoded_png(8, 4, [255, 0, 0]));
        let image = decode_image(&raw).unwrap();
        let characteristics = ExtractorCharacteristics {
            input_size: 16,
            ..ExtractorCharacteristics::default()
        };
        let tensor = image_to_tensor(&image, &characteristics);
        assert_eq!(tensor.shape(), &[1, 3, 16, 16]);

        let red = (1.0 - 0.485) / 0.229;
        let green = (0.0 - 0.456) / 0.224;
        assert!((tensor[[0, 0, 5, 5]] - red).abs() < 1e-4);
        assert!((tensor[[0, 1, 5, 5]] - green).abs() < 1e-4);
    }
}
