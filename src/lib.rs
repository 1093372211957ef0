use std::path::{Path, PathBuf};

use image::DynamicImage;
use ndarray::{Array1, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use tracing::instrument;

pub mod annotation;
pub mod augment;
mod error;
pub mod geometry;
pub mod raster;
mod result;
pub mod util;
pub mod vocab;

pub use annotation::{AnnotationReader, JsonAnnotationReader, TextPolygon, WordLabel};
pub use error::{DatasetError, Result};
pub use result::*;
pub use vocab::{Vocabulary, VocabularyType};

use augment::RasterStack;
use util::{MEAN_VALUES, NORM_VALUES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    #[default]
    Train,
    Test,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub split: Split,
    /// Enables random scaling, flipping, rotation, cropping and color jitter.
    pub is_transform: bool,
    /// Side of the square training crop.
    pub img_size: u32,
    pub short_size: u32,
    pub kernel_scale: f32,
    pub max_shrink: i64,
    pub with_recognition: bool,
    pub max_word_num: usize,
    pub max_word_len: usize,
    pub vocabulary: VocabularyType,
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            split: Split::Train,
            is_transform: false,
            img_size: 640,
            short_size: 640,
            kernel_scale: 0.7,
            max_shrink: geometry::DEFAULT_MAX_SHRINK,
            with_recognition: false,
            max_word_num: 200,
            max_word_len: 32,
            vocabulary: VocabularyType::Lowercase,
            seed: 123456,
        }
    }
}

impl DatasetConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DatasetError::InvalidConfig(msg));
        if !(self.kernel_scale > 0.0 && self.kernel_scale < 1.0) {
            return invalid(format!("kernel_scale must be in (0, 1), got {}", self.kernel_scale));
        }
        if self.max_word_num == 0 || self.max_word_num > u8::MAX as usize {
            return invalid(format!(
                "max_word_num must be in 1..=255 to fit the instance map, got {}",
                self.max_word_num
            ));
        }
        if self.max_word_len == 0 {
            return invalid("max_word_len must be positive".to_string());
        }
        if self.img_size == 0 || self.short_size == 0 {
            return invalid(format!(
                "img_size and short_size must be positive, got {} and {}",
                self.img_size, self.short_size
            ));
        }
        if self.max_shrink < 0 {
            return invalid(format!("max_shrink must not be negative, got {}", self.max_shrink));
        }
        Ok(())
    }
}

/// One image and, for training, its annotation file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSource {
    pub image_path: PathBuf,
    pub annotation_path: Option<PathBuf>,
}

pub struct TextDatasetBuilder {
    config: DatasetConfig,
    samples: Vec<SampleSource>,
    reader: Option<Box<dyn AnnotationReader + Send + Sync>>,
    vocabulary: Option<Vocabulary>,
}

impl TextDatasetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: DatasetConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn split(mut self, split: Split) -> Self {
        self.config.split = split;
        self
    }

    pub fn transform(mut self, is_transform: bool) -> Self {
        self.config.is_transform = is_transform;
        self
    }

    pub fn img_size(mut self, img_size: u32) -> Self {
        self.config.img_size = img_size;
        self
    }

    pub fn short_size(mut self, short_size: u32) -> Self {
        self.config.short_size = short_size;
        self
    }

    pub fn kernel_scale(mut self, kernel_scale: f32) -> Self {
        self.config.kernel_scale = kernel_scale;
        self
    }

    pub fn max_shrink(mut self, max_shrink: i64) -> Self {
        self.config.max_shrink = max_shrink;
        self
    }

    pub fn with_recognition(mut self, with_recognition: bool) -> Self {
        self.config.with_recognition = with_recognition;
        self
    }

    pub fn max_word_num(mut self, max_word_num: usize) -> Self {
        self.config.max_word_num = max_word_num;
        self
    }

    pub fn max_word_len(mut self, max_word_len: usize) -> Self {
        self.config.max_word_len = max_word_len;
        self
    }

    pub fn vocabulary(mut self, voc_type: VocabularyType) -> Self {
        self.config.vocabulary = voc_type;
        self.vocabulary = None;
        self
    }

    /// Uses a custom symbol table instead of one of the built-in ones.
    pub fn custom_vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn sample(mut self, image_path: impl Into<PathBuf>, annotation_path: impl Into<PathBuf>) -> Self {
        self.samples.push(SampleSource {
            image_path: image_path.into(),
            annotation_path: Some(annotation_path.into()),
        });
        self
    }

    /// Adds an image without annotations, for the test split.
    pub fn image(mut self, image_path: impl Into<PathBuf>) -> Self {
        self.samples.push(SampleSource {
            image_path: image_path.into(),
            annotation_path: None,
        });
        self
    }

    pub fn samples(mut self, samples: impl IntoIterator<Item = SampleSource>) -> Self {
        self.samples.extend(samples);
        self
    }

    pub fn annotation_reader(mut self, reader: impl AnnotationReader + Send + Sync + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    #[instrument(skip(self))]
    pub fn build(self) -> Result<TextDataset> {
        self.config.validate()?;
        let vocabulary = self
            .vocabulary
            .unwrap_or_else(|| Vocabulary::new(self.config.vocabulary));
        log::debug!(
            "Built {:?} dataset with {} samples, vocabulary of {} ids",
            self.config.split,
            self.samples.len(),
            vocabulary.len()
        );
        Ok(TextDataset {
            config: self.config,
            samples: self.samples,
            reader: self.reader.unwrap_or_else(|| Box::new(JsonAnnotationReader)),
            vocabulary,
        })
    }
}

impl Default for TextDatasetBuilder {
    fn default() -> Self {
        Self {
            config: DatasetConfig::default(),
            samples: Vec::new(),
            reader: None,
            vocabulary: None,
        }
    }
}

/// Turns annotated images into detection (and optionally recognition)
/// training targets. All state is read-only after construction, so one
/// dataset can serve many worker threads.
pub struct TextDataset {
    config: DatasetConfig,
    samples: Vec<SampleSource>,
    reader: Box<dyn AnnotationReader + Send + Sync>,
    vocabulary: Vocabulary,
}

fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| {
        log::error!("Failed to read image {}", path.display());
        DatasetError::Image {
            path: path.to_path_buf(),
            source,
        }
    })
}

impl TextDataset {
    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn source(&self, index: usize) -> Result<&SampleSource> {
        self.samples.get(index).ok_or(DatasetError::IndexOutOfRange {
            index,
            len: self.samples.len(),
        })
    }

    /// Generator for sample `index`, fixed by the configured seed.
    pub fn sample_rng(&self, index: usize) -> StdRng {
        StdRng::seed_from_u64(self.config.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    pub fn get<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Sample> {
        match self.config.split {
            Split::Train => self.prepare_train(index, rng).map(Sample::Train),
            Split::Test => self.prepare_test(index).map(Sample::Test),
        }
    }

    /// Sorted set of lowercased readable transcriptions over all samples.
    pub fn full_lexicon(&self) -> Result<Vec<String>> {
        let mut lexicon = std::collections::BTreeSet::new();
        for source in &self.samples {
            let Some(annotation_path) = &source.annotation_path else {
                continue;
            };
            let (width, height) = image::image_dimensions(&source.image_path).map_err(|source_err| {
                DatasetError::Image {
                    path: source.image_path.clone(),
                    source: source_err,
                }
            })?;
            for polygon in self.reader.read(annotation_path, width, height)? {
                if let Some(text) = polygon.label.text() {
                    lexicon.insert(text.to_lowercase());
                }
            }
        }
        Ok(lexicon.into_iter().collect())
    }

    fn word_targets(&self, polygons: &[TextPolygon]) -> (Array2<i32>, Array1<i32>) {
        let capacity = self.config.max_word_num + 1;
        let max_len = self.config.max_word_len;
        let mut gt_words = Array2::<i32>::from_elem((capacity, max_len), self.vocabulary.pad());
        let mut word_mask = Array1::<i32>::zeros(capacity);
        for (i, polygon) in polygons.iter().enumerate() {
            let Some(text) = polygon.label.text() else {
                continue;
            };
            let ids = self.vocabulary.encode(&text.to_lowercase(), max_len);
            gt_words.row_mut(i + 1).assign(&Array1::from(ids));
            word_mask[i + 1] = 1;
        }
        (gt_words, word_mask)
    }

    #[instrument(skip(self, rng), level = "debug")]
    pub fn prepare_train<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<TrainSample> {
        let config = &self.config;
        let source = self.source(index)?;
        let image = load_image(&source.image_path)?;
        let annotation_path = source
            .annotation_path
            .as_ref()
            .ok_or(DatasetError::MissingAnnotation(index))?;
        let mut polygons = self
            .reader
            .read(annotation_path, image.width(), image.height())?;
        if polygons.len() > config.max_word_num {
            log::debug!(
                "Keeping {} of {} polygons in {:?}",
                config.max_word_num,
                polygons.len(),
                annotation_path
            );
            polygons.truncate(config.max_word_num);
        }

        let (gt_words, mut word_mask) = self.word_targets(&polygons);

        let image = if config.is_transform {
            augment::random_scale(&image, config.short_size, rng)
        } else {
            image
        };
        let image = image.to_rgb8();
        let size = image.dimensions();

        let boxes = polygons
            .iter()
            .map(|polygon| polygon.to_pixels(size.0, size.1))
            .collect::<Vec<_>>();
        let labels = polygons
            .iter()
            .map(|polygon| polygon.label.clone())
            .collect::<Vec<_>>();

        let (instance, training_mask) = raster::draw_instances(&boxes, &labels, size);
        augment::drop_empty_words(&instance, &mut word_mask);
        let text_distance = raster::polygon_distance_map(&boxes, size);

        let kernel_boxes = geometry::shrink(&boxes, config.kernel_scale, config.max_shrink);
        let kernel = raster::draw_kernel(&kernel_boxes, size);
        let kernel_distance = raster::polygon_distance_map(&kernel_boxes, size);

        let mut stack = RasterStack {
            image,
            instance,
            training_mask,
            kernels: vec![kernel],
            distances: vec![text_distance, kernel_distance],
        };

        #[cfg(feature = "debug")]
        util::save_debug_layers(&stack, index, "raw");

        if config.is_transform {
            if !config.with_recognition {
                augment::random_horizontal_flip(&mut stack, rng);
            }
            augment::random_rotate(&mut stack, rng);
            let instance_before_crop = stack.instance.clone();
            augment::random_crop_padding(&mut stack, (config.img_size, config.img_size), rng);
            augment::prune_word_mask(&instance_before_crop, &stack.instance, &mut word_mask);

            #[cfg(feature = "debug")]
            util::save_debug_layers(&stack, index, "augmented");
        }

        let gt_bboxes = raster::instance_bounding_boxes(&stack.instance, config.max_word_num + 1);

        let RasterStack {
            mut image,
            instance,
            training_mask,
            kernels,
            distances,
        } = stack;
        let (width, height) = image.dimensions();
        let shape = (height as usize, width as usize);

        if config.is_transform {
            util::color_jitter(&mut image, rng);
        }
        let image = util::subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES);

        let gt_instance = util::gray_to_array(instance)?;
        let gt_text = gt_instance.mapv(|id| u8::from(id > 0));
        let gt_kernels = util::stack_layers(
            kernels
                .into_iter()
                .map(util::gray_to_array)
                .collect::<Result<Vec<_>>>()?,
            shape,
        )?;
        let gt_distances = util::stack_layers(
            distances
                .into_iter()
                .map(util::distance_to_array)
                .collect::<Result<Vec<_>>>()?,
            shape,
        )?;

        Ok(TrainSample {
            image,
            gt_text,
            gt_kernels,
            gt_distances,
            training_mask: util::gray_to_array(training_mask)?,
            gt_instance,
            gt_bboxes,
            words: config
                .with_recognition
                .then_some(WordTargets { gt_words, word_mask }),
        })
    }

    #[instrument(skip(self), level = "debug")]
    pub fn prepare_test(&self, index: usize) -> Result<TestSample> {
        let source = self.source(index)?;
        let image = load_image(&source.image_path)?;
        let original_size = (image.height(), image.width());

        let image = util::scale_aligned_short(&image, self.config.short_size).to_rgb8();
        let image_size = (image.height(), image.width());

        Ok(TestSample {
            image: util::subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES),
            meta: ImageMeta {
                original_size,
                image_size,
            },
        })
    }
}
