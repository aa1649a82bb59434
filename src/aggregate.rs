use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::instrument;

use crate::{
    vision_client::empty_result, Error, ExportedCrop, ItemOutcome, OcrResult, OrderedDetection,
    ProcessedEntry, RecognitionError, Result,
};

/// Joins recognition outcomes back onto the exported crops by reading index.
///
/// The output has exactly one entry per crop, in reading order, whatever order
/// the outcomes arrived in. Failed or missing outcomes become empty entries.
#[instrument(level = "debug", skip_all, fields(crops = crops.len(), outcomes = outcomes.len()))]
pub fn merge_outcomes(
    crops: &[ExportedCrop],
    outcomes: Vec<ItemOutcome<OcrResult, RecognitionError>>,
) -> Vec<OcrResult> {
    let mut by_index = HashMap::with_capacity(outcomes.len());
    for outcome in outcomes {
        by_index.insert(outcome.reading_index, outcome.result);
    }

    let mut ordered = crops.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|it| it.reading_index);
    ordered
        .into_iter()
        .map(|crop| match by_index.remove(&crop.reading_index) {
            Some(Ok(result)) => result,
            Some(Err(err)) => {
                log::warn!("Recognition failed for {}: {err}", crop.file_name);
                empty_result(crop)
            }
            None => {
                log::warn!("No recognition outcome for {}", crop.file_name);
                empty_result(crop)
            }
        })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).map_err(|err| Error::io(path, err))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| Error::io(path, err))?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| Error::io(path, err))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Writes `processed_results.json`.
pub fn write_processed(path: &Path, detections: &[OrderedDetection]) -> Result<()> {
    let entries = detections
        .iter()
        .map(ProcessedEntry::from)
        .collect::<Vec<_>>();
    write_json(path, &entries)
}

pub fn load_processed(path: &Path) -> Result<Vec<ProcessedEntry>> {
    read_json(path)
}

/// Writes `json_results.json`.
pub fn write_results(path: &Path, results: &[OcrResult]) -> Result<()> {
    write_json(path, results)
}

pub fn load_results(path: &Path) -> Result<Vec<OcrResult>> {
    read_json(path)
}
