use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use textgt::{DatasetConfig, DatasetError, Sample, Split, TextDatasetBuilder, VocabularyType};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    image.save(&path).expect("Failed to write test image");
    path
}

fn write_annotation(dir: &Path, name: &str, json: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, json).expect("Failed to write test annotation");
    path
}

const SQUARE_HI: &str = r#"{"polygons": [
    {"points": [[40, 40], [59, 40], [59, 59], [40, 59]], "text": "hi"}
]}"#;

#[test]
fn square_word_targets() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 200, 100);
    let gt = write_annotation(dir.path(), "img.json", SQUARE_HI);

    let dataset = TextDatasetBuilder::new()
        .kernel_scale(0.7)
        .with_recognition(true)
        .sample(image, gt)
        .build()
        .expect("Failed to build dataset");
    let mut rng = dataset.sample_rng(0);
    let sample = dataset.prepare_train(0, &mut rng).expect("Failed to prepare sample");

    assert_eq!(sample.image.dim(), (3, 100, 200));
    assert_eq!(sample.gt_instance.dim(), (100, 200));
    assert_eq!(sample.gt_instance.iter().filter(|v| **v == 1).count(), 400);
    assert_eq!(sample.gt_instance.iter().filter(|v| **v == 0).count(), 200 * 100 - 400);
    assert_eq!(sample.gt_text.iter().map(|v| *v as usize).sum::<usize>(), 400);
    assert!(sample.training_mask.iter().all(|v| *v == 1));

    assert_eq!(sample.gt_kernels.dim(), (1, 100, 200));
    let kernel_area = sample.gt_kernels.iter().map(|v| *v as usize).sum::<usize>();
    assert!(kernel_area > 0 && kernel_area < 400, "kernel area {kernel_area}");

    assert_eq!(sample.gt_distances.dim(), (2, 100, 200));
    let centre = sample.gt_distances[[0, 50, 50]];
    assert!((centre - 10.0).abs() <= 1.0, "centre distance {centre}");
    assert_eq!(sample.gt_distances[[0, 10, 10]], 0.0);
    assert!(sample.gt_distances[[1, 50, 50]] < centre);

    assert_eq!(sample.gt_bboxes.dim(), (201, 4));
    assert_eq!(sample.gt_bboxes.row(1).to_vec(), vec![40, 40, 60, 60]);
    assert!(sample.gt_bboxes.row(2).iter().all(|v| *v == 0));

    let voc = dataset.vocabulary();
    let words = sample.words.expect("Recognition targets missing");
    assert_eq!(words.gt_words.dim(), (201, 32));
    let mut expected = vec![voc.pad(); 32];
    expected[0] = voc.id('h');
    expected[1] = voc.id('i');
    expected[2] = voc.eos();
    assert_eq!(words.gt_words.row(1).to_vec(), expected);
    assert!(words.gt_words.row(0).iter().all(|v| *v == voc.pad()));
    assert_eq!(words.word_mask[1], 1);
    assert_eq!(words.word_mask.sum(), 1);
}

#[test]
fn ignored_words_and_word_limit() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 64, 64);
    let gt = write_annotation(
        dir.path(),
        "img.json",
        r####"{"polygons": [
            {"points": [[0, 0], [9, 0], [9, 9], [0, 9]], "text": "###"},
            {"points": [[20, 0], [29, 0], [29, 9], [20, 9]], "text": "???"},
            {"points": [[40, 0], [49, 0], [49, 9], [40, 9]], "text": "Ok"},
            {"points": [[0, 40], [9, 40], [9, 49], [0, 49]], "text": "dropped"}
        ]}"####,
    );

    let dataset = TextDatasetBuilder::new()
        .max_word_num(3)
        .with_recognition(true)
        .sample(image, gt)
        .build()
        .unwrap();
    let sample = dataset.prepare_train(0, &mut dataset.sample_rng(0)).unwrap();

    // ignored words still own instance pixels
    assert_eq!(sample.gt_instance[[5, 5]], 1);
    assert_eq!(sample.gt_instance[[5, 25]], 2);
    assert_eq!(sample.gt_instance[[5, 45]], 3);
    assert_eq!(sample.gt_instance[[45, 5]], 0);

    // only the unreadable word leaves the loss
    assert_eq!(sample.training_mask[[5, 5]], 0);
    assert_eq!(sample.training_mask[[5, 25]], 1);
    assert_eq!(sample.training_mask.iter().filter(|v| **v == 0).count(), 100);

    let words = sample.words.unwrap();
    assert_eq!(words.word_mask.to_vec(), vec![0, 0, 0, 1]);
    assert_eq!(dataset.vocabulary().decode(&words.gt_words.row(3).to_vec()), "ok");
    assert_eq!(sample.gt_bboxes.dim(), (4, 4));
}

#[test]
fn words_need_pixels_to_supervise_recognition() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 100, 100);
    let gt = write_annotation(
        dir.path(),
        "img.json",
        r#"{"polygons": [
            {"points": [[10, 10], [10, 10], [10, 10]], "text": "pt"},
            {"points": [[50, 50], [55, 50], [55, 55], [50, 55]], "text": "ab"},
            {"points": [[40, 40], [70, 40], [70, 70], [40, 70]], "text": "cd"}
        ]}"#,
    );

    let dataset = TextDatasetBuilder::new()
        .with_recognition(true)
        .sample(image, gt)
        .build()
        .unwrap();
    let sample = dataset.prepare_train(0, &mut dataset.sample_rng(0)).unwrap();

    // a collapsed polygon still owns its pixel
    assert_eq!(sample.gt_instance.iter().filter(|v| **v == 1).count(), 1);
    assert_eq!(sample.gt_instance[[10, 10]], 1);
    assert_eq!(sample.gt_bboxes.row(1).to_vec(), vec![10, 10, 11, 11]);

    // the second word is fully covered by the third
    assert_eq!(sample.gt_instance.iter().filter(|v| **v == 2).count(), 0);
    assert!(sample.gt_bboxes.row(2).iter().all(|v| *v == 0));

    let words = sample.words.unwrap();
    assert_eq!(words.word_mask[1], 1);
    assert_eq!(words.word_mask[2], 0);
    assert_eq!(words.word_mask[3], 1);
    assert_eq!(words.word_mask.sum(), 2);
}

#[test]
fn recognition_disables_flipping() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 200, 100);
    let gt = write_annotation(
        dir.path(),
        "img.json",
        r#"{"polygons": [
            {"points": [[10, 40], [40, 40], [40, 60], [10, 60]], "text": "hi"}
        ]}"#,
    );

    for seed in 0..24 {
        // the crop window covers the whole scaled image, so only padding applies
        let dataset = TextDatasetBuilder::new()
            .transform(true)
            .with_recognition(true)
            .short_size(100)
            .img_size(320)
            .seed(seed)
            .sample(&image, &gt)
            .build()
            .unwrap();
        let sample = dataset.prepare_train(0, &mut dataset.sample_rng(0)).unwrap();

        let content_width = sample
            .training_mask
            .outer_iter()
            .map(|row| row.iter().filter(|v| **v == 1).count())
            .max()
            .unwrap_or(0) as i32;
        let [_, left, _, right] = [0usize, 1, 2, 3].map(|i| sample.gt_bboxes[[1, i]]);
        assert!(right > left, "seed {seed}: word lost");
        assert!(
            right * 2 < content_width,
            "seed {seed}: word at {left}..{right} in an image {content_width} wide"
        );
        assert_eq!(sample.words.as_ref().unwrap().word_mask[1], 1);
    }
}

#[test]
fn augmented_samples_have_crop_size_and_are_reproducible() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 200, 100);
    let gt = write_annotation(dir.path(), "img.json", SQUARE_HI);

    for with_recognition in [false, true] {
        let dataset = TextDatasetBuilder::new()
            .transform(true)
            .img_size(256)
            .short_size(256)
            .with_recognition(with_recognition)
            .seed(42)
            .sample(&image, &gt)
            .build()
            .unwrap();

        let first = dataset.prepare_train(0, &mut dataset.sample_rng(0)).unwrap();
        let second = dataset.prepare_train(0, &mut dataset.sample_rng(0)).unwrap();

        assert_eq!(first.image.dim(), (3, 256, 256));
        assert_eq!(first.gt_instance.dim(), (256, 256));
        assert_eq!(first.training_mask.dim(), (256, 256));
        assert_eq!(first.gt_kernels.dim(), (1, 256, 256));
        assert_eq!(first.gt_distances.dim(), (2, 256, 256));
        assert!(first.gt_instance.iter().all(|v| *v <= 1));
        assert!(first.gt_kernels.iter().all(|v| *v <= 1));

        assert_eq!(first.gt_instance, second.gt_instance);
        assert_eq!(first.gt_kernels, second.gt_kernels);
        assert_eq!(first.gt_distances, second.gt_distances);
        assert_eq!(first.image, second.image);
        assert_eq!(first.gt_bboxes, second.gt_bboxes);
        assert_eq!(first.words.is_some(), with_recognition);
    }
}

#[test]
fn samples_can_be_prepared_in_parallel() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 200, 100);
    let gt = write_annotation(dir.path(), "img.json", SQUARE_HI);
    let dataset = TextDatasetBuilder::new()
        .transform(true)
        .img_size(128)
        .short_size(128)
        .sample(&image, &gt)
        .sample(&image, &gt)
        .build()
        .unwrap();

    std::thread::scope(|scope| {
        let handles = (0..dataset.len())
            .map(|index| {
                let dataset = &dataset;
                scope.spawn(move || dataset.prepare_train(index, &mut dataset.sample_rng(index)))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let sample = handle.join().expect("Worker panicked").unwrap();
            assert_eq!(sample.gt_instance.dim(), (128, 128));
        }
    });
}

#[test]
fn test_split_records_sizes() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 200, 100);

    let dataset = TextDatasetBuilder::new()
        .split(Split::Test)
        .short_size(640)
        .image(image)
        .build()
        .unwrap();

    let Sample::Test(sample) = dataset.get(0, &mut dataset.sample_rng(0)).unwrap() else {
        panic!("Expected a test sample");
    };
    assert_eq!(sample.meta.original_size, (100, 200));
    assert_eq!(sample.meta.image_size, (640, 1280));
    assert_eq!(sample.image.dim(), (3, 640, 1280));
}

#[test]
fn unreadable_image_is_fatal() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let gt = write_annotation(dir.path(), "img.json", SQUARE_HI);
    let dataset = TextDatasetBuilder::new()
        .sample(dir.path().join("missing.png"), gt)
        .build()
        .unwrap();

    let err = dataset.prepare_train(0, &mut dataset.sample_rng(0)).unwrap_err();
    assert!(matches!(err, DatasetError::Image { ref path, .. } if path.ends_with("missing.png")));

    let err = dataset.prepare_train(1, &mut dataset.sample_rng(1)).unwrap_err();
    assert!(matches!(err, DatasetError::IndexOutOfRange { index: 1, len: 1 }));
}

#[test]
fn train_sample_without_annotation_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_image(dir.path(), "img.png", 32, 32);
    let dataset = TextDatasetBuilder::new().image(image).build().unwrap();
    assert!(matches!(
        dataset.prepare_train(0, &mut dataset.sample_rng(0)),
        Err(DatasetError::MissingAnnotation(0))
    ));
}

#[test]
fn invalid_configuration_fails_at_build() {
    assert!(matches!(
        TextDatasetBuilder::new().kernel_scale(1.5).build(),
        Err(DatasetError::InvalidConfig(_))
    ));
    assert!(matches!(
        TextDatasetBuilder::new().max_word_num(300).build(),
        Err(DatasetError::InvalidConfig(_))
    ));
    assert!(matches!(
        TextDatasetBuilder::new().max_word_len(0).build(),
        Err(DatasetError::InvalidConfig(_))
    ));

    let err = serde_json::from_str::<DatasetConfig>(r#"{"vocabulary": "KLINGON"}"#).unwrap_err();
    assert!(err.to_string().contains("KLINGON"));

    let config: DatasetConfig =
        serde_json::from_str(r#"{"split": "test", "vocabulary": "ALLCASES", "img_size": 512}"#).unwrap();
    assert_eq!(config.split, Split::Test);
    assert_eq!(config.vocabulary, VocabularyType::AllCases);
    assert_eq!(config.img_size, 512);
    assert_eq!(config.kernel_scale, 0.7);
}

#[test]
fn lexicon_collects_readable_words() {
    let dir = tempfile::tempdir().unwrap();
    let first = write_image(dir.path(), "a.png", 32, 32);
    let second = write_image(dir.path(), "b.png", 32, 32);
    let gt_first = write_annotation(
        dir.path(),
        "a.json",
        r####"{"polygons": [
            {"points": [[0, 0], [9, 0], [9, 9]], "text": "Hello"},
            {"points": [[0, 0], [9, 0], [9, 9]], "text": "###"}
        ]}"####,
    );
    let gt_second = write_annotation(
        dir.path(),
        "b.json",
        r#"{"polygons": [
            {"points": [[0, 0], [9, 0], [9, 9]], "text": "world"},
            {"points": [[0, 0], [9, 0], [9, 9]], "text": "hello"},
            {"points": [[0, 0], [9, 0], [9, 9]]}
        ]}"#,
    );
    let dataset = TextDatasetBuilder::new()
        .sample(first, gt_first)
        .sample(second, gt_second)
        .build()
        .unwrap();
    assert_eq!(dataset.full_lexicon().unwrap(), vec!["hello", "world"]);
}
