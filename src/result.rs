use ndarray::{Array1, Array2, Array3};

/// Recognition targets. Row `id` of both tables belongs to instance `id`;
/// row 0 is never used.
#[derive(Debug, Clone)]
pub struct WordTargets {
    /// `(max_word_num + 1, max_word_len)` encoded transcriptions.
    pub gt_words: Array2<i32>,
    /// `(max_word_num + 1,)`, 1 where the transcription supervises recognition.
    pub word_mask: Array1<i32>,
}

#[derive(Debug, Clone)]
pub struct TrainSample {
    /// Normalized image, `(3, H, W)`.
    pub image: Array3<f32>,
    /// Text mask, 1 on any instance pixel.
    pub gt_text: Array2<u8>,
    /// One 0/1 kernel layer per kernel scale, `(K, H, W)`.
    pub gt_kernels: Array3<u8>,
    /// Distance fields of the full polygons followed by those of the kernels,
    /// `(1 + K, H, W)`.
    pub gt_distances: Array3<f32>,
    pub training_mask: Array2<u8>,
    pub gt_instance: Array2<u8>,
    /// `(max_word_num + 1, 4)` rows of `(top, left, bottom, right)`, bottom and
    /// right exclusive.
    pub gt_bboxes: Array2<i32>,
    pub words: Option<WordTargets>,
}

/// Sizes are `(height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMeta {
    pub original_size: (u32, u32),
    pub image_size: (u32, u32),
}

#[derive(Debug, Clone)]
pub struct TestSample {
    pub image: Array3<f32>,
    pub meta: ImageMeta,
}

#[derive(Debug, Clone)]
pub enum Sample {
    Train(TrainSample),
    Test(TestSample),
}
