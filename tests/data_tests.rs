use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use face_embed::data::{self, Dataset, LearningRateSchedule};
use face_embed::{FaceEmbedError, TrainConfig};

use test_utils::*;

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[test]
fn learning_rate_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "lr.txt", "0:0.1\n10:0.01\n20:0.001\n");
    assert_eq!(data::get_learning_rate_from_file(&path, 15).unwrap(), 0.01);
    assert_eq!(data::get_learning_rate_from_file(&path, 25).unwrap(), 0.001);
    assert_eq!(data::get_learning_rate_from_file(&path, 5).unwrap(), 0.1);
    assert_eq!(data::get_learning_rate_from_file(&path, 10).unwrap(), 0.01);
}

#[test]
fn learning_rate_schedule_default_and_order() {
    let schedule = LearningRateSchedule::from_reader(Cursor::new("5:0.05\n")).unwrap();
    assert_eq!(schedule.rate(2), data::DEFAULT_LEARNING_RATE);
    // The last matching line wins, even when lines are not sorted.
    let schedule = LearningRateSchedule::from_reader(Cursor::new("10:0.01\n\n0:0.5\n")).unwrap();
    assert_eq!(schedule.rate(12), 0.5);
}

#[test]
fn malformed_schedule() {
    let err = LearningRateSchedule::from_reader(Cursor::new("0:0.1\n10\n")).unwrap_err();
    match err {
        FaceEmbedError::FileFormat(msg) => assert!(msg.contains(":2:"), "{msg}"),
        err => panic!("unexpected error {err:?}"),
    }
    assert!(matches!(
        LearningRateSchedule::from_reader(Cursor::new("x:0.1\n")),
        Err(FaceEmbedError::ParseInt(_))
    ));
    assert!(matches!(
        LearningRateSchedule::from_reader(Cursor::new("1:fast\n")),
        Err(FaceEmbedError::ParseFloat(_))
    ));
    assert!(matches!(
        data::get_learning_rate_from_file("/nonexistent/lr.txt", 1),
        Err(FaceEmbedError::Io(_))
    ));
}

#[test]
fn manifest_with_offset() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let list = write_file(dir.path(), "list.txt", "a.jpg 0\nb.jpg 1\n");
    let dataset = data::get_datasets("/data", &list, 10)?;
    assert_eq!(dataset.paths, [PathBuf::from("/data/a.jpg"), PathBuf::from("/data/b.jpg")]);
    assert_eq!(dataset.labels, [10, 11]);
    assert_eq!(dataset.num_classes, 2);
    assert_eq!(vec_i64_from(&dataset.labels_tensor()), [10, 11]);
    Ok(())
}

#[test]
fn malformed_manifest() {
    let data_dir = Path::new("/data");
    let err = Dataset::from_reader(data_dir, Cursor::new("a.jpg 0\nb.jpg\n"), 0).unwrap_err();
    assert!(matches!(err, FaceEmbedError::FileFormat(_)));
    let err = Dataset::from_reader(data_dir, Cursor::new("a.jpg zero\n"), 0).unwrap_err();
    assert!(matches!(err, FaceEmbedError::ParseInt(_)));
    let dataset = Dataset::from_reader(data_dir, Cursor::new("\na.jpg 3\n\n"), 0).unwrap();
    assert_eq!(dataset.len(), 1);
}

#[test]
fn file_errors_name_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let list = write_file(dir.path(), "list.txt", "a.jpg 0\nb.jpg\n");
    match data::get_datasets("/data", &list, 0) {
        Err(FaceEmbedError::FileFormat(msg)) => assert!(msg.contains("list.txt:2:"), "{msg}"),
        other => panic!("unexpected result {other:?}"),
    }
    let schedule = write_file(dir.path(), "lr.txt", "0:0.1\n\n20\n");
    match data::get_learning_rate_from_file(&schedule, 1) {
        Err(FaceEmbedError::FileFormat(msg)) => assert!(msg.contains("lr.txt:3:"), "{msg}"),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn merge_datasets() {
    let data_dir = Path::new("/data");
    let first = Dataset::from_reader(data_dir, Cursor::new("a.jpg 0\nb.jpg 1\nc.jpg 1\n"), 0);
    let second = Dataset::from_reader(data_dir, Cursor::new("d.jpg 0\ne.jpg 1\n"), 2);
    let merged = first.unwrap().merge(second.unwrap());
    assert_eq!(merged.len(), 5);
    assert_eq!(merged.labels, [0, 1, 1, 2, 3]);
    assert_eq!(merged.num_classes, 4);
}

#[test]
fn batch_iter() {
    let paths = (0..10).map(|i| PathBuf::from(format!("{i}.jpg"))).collect();
    let dataset = Dataset::new(paths, (0..10).collect());

    let batches: Vec<_> = dataset.iter(4).collect();
    assert_eq!(batches.len(), 2);
    assert_eq!(vec_i64_from(&batches[1].1), [4, 5, 6, 7]);
    assert_eq!(batches[1].0[0], PathBuf::from("4.jpg"));

    let mut seen = vec![];
    for (paths, labels) in dataset.iter(4).shuffle().return_smaller_last_batch() {
        let labels = vec_i64_from(&labels);
        assert_eq!(paths.len(), labels.len());
        for (path, label) in paths.iter().zip(labels.iter()) {
            assert_eq!(path, &PathBuf::from(format!("{label}.jpg")));
        }
        seen.extend(labels);
    }
    seen.sort();
    assert_eq!(seen, (0..10).collect::<Vec<i64>>());
}

#[test]
fn shuffled_batches() {
    let paths = (0..200).map(|i| PathBuf::from(format!("{i}.jpg"))).collect();
    let dataset = Dataset::new(paths, (0..200).collect());
    let mut all_in_order = true;
    let mut previous = -1;
    for (paths, labels) in dataset.iter(8).shuffle() {
        assert_eq!(paths.len(), 8);
        for (path, label) in paths.iter().zip(vec_i64_from(&labels)) {
            assert_eq!(path, &PathBuf::from(format!("{label}.jpg")));
            if label != previous + 1 {
                all_in_order = false
            }
            previous = label;
        }
    }
    assert!(!all_in_order)
}

#[test]
fn train_config() {
    let dir = tempfile::tempdir().unwrap();
    let schedule = write_file(dir.path(), "lr.txt", "0:0.1\n10:0.01\n");
    let json = format!(
        r#"{{"optimizer": "RMSPROP", "learning_rate_schedule_file": {:?}, "center_loss_factor": 0.01}}"#,
        schedule.to_str().unwrap()
    );
    let path = write_file(dir.path(), "config.json", &json);
    let config = TrainConfig::from_json_file(&path).unwrap();
    assert_eq!(config.optimizer.name(), "RMSPROP");
    assert_eq!(config.center_loss_factor, 0.01);
    assert_eq!(config.embedding_size, 128);
    assert_eq!(config.learning_rate_for_epoch(11).unwrap(), 0.01);

    let path = write_file(dir.path(), "bad.json", r#"{"keep_prob": 1.5}"#);
    assert!(matches!(TrainConfig::from_json_file(&path), Err(FaceEmbedError::Config(_))));
    let path = write_file(dir.path(), "broken.json", "{");
    assert!(matches!(TrainConfig::from_json_file(&path), Err(FaceEmbedError::Json(_))));
}
