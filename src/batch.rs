use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::GrayImage;
use log::{debug, warn};
use logging_timer::time;
use rayon::prelude::*;
use rayon::ThreadPoolBuildError;
use thiserror::Error;

use crate::debug::QuestionnaireDebugWriter;
use crate::regions::ReferenceRegions;
use crate::register::{AlignmentError, Registrar};
use crate::results::{FileFailure, ResultRow, ResultTable};
use crate::score::{score_questionnaire, ScoringError};

const RASTER_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "gif", "webp"];

/// Why a single questionnaire could not be scored. These never abort the
/// batch.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("unable to read image {path}: {source}")]
    Io {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
}

impl FileError {
    pub fn kind(&self) -> &'static str {
        match self {
            FileError::Io { .. } => "IOError",
            FileError::Alignment(_) => "AlignmentError",
            FileError::Scoring(_) => "ScoringError",
        }
    }
}

/// Everything a worker needs to score a questionnaire. Built once and
/// shared read-only across workers.
#[derive(Debug)]
pub struct PipelineContext {
    pub registrar: Registrar,
    pub regions: ReferenceRegions,
    pub debug: QuestionnaireDebugWriter,
}

/// Identifier used for a candidate in the result table: its file stem.
pub fn file_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// One identifier per path, in order. Paths whose stems collide (`a.png`
/// and `a.jpg`) are identified by their full file name instead.
pub fn file_ids(paths: &[PathBuf]) -> Vec<String> {
    let stems: Vec<String> = paths.iter().map(|path| file_id(path)).collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *counts.entry(stem.as_str()).or_default() += 1;
    }

    paths
        .iter()
        .zip(&stems)
        .map(|(path, stem)| {
            if counts[stem.as_str()] == 1 {
                return stem.clone();
            }
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned());
            warn!("{}: file stem {} is not unique, using {}", path.display(), stem, name);
            name
        })
        .collect()
}

#[time]
pub fn load_candidate_image(path: &Path) -> Result<GrayImage, FileError> {
    image::open(path)
        .map(|img| img.into_luma8())
        .map_err(|source| FileError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Loads, registers and scores one questionnaire, mapping each selected
/// option to its label. `id` names the row and any debug images.
#[time]
pub fn interpret_questionnaire(
    path: &Path,
    id: &str,
    context: &PipelineContext,
) -> Result<ResultRow, FileError> {
    let candidate = load_candidate_image(path)?;
    let registration = context.registrar.register(&candidate)?;
    debug!(
        "{}: aligned with {} of {} matches, transform {:?}",
        path.display(),
        registration.n_inliers,
        registration.n_matches,
        registration.transform.matrix()
    );

    let scores = score_questionnaire(&registration.image, &context.regions)?;

    let answers = context
        .regions
        .questions()
        .iter()
        .zip(&scores)
        .map(|(question, score)| {
            debug!(
                "{}: {} scores {:?}, selected {}",
                path.display(),
                question.id,
                score.scores,
                score.selected
            );
            question
                .layout
                .label(score.selected)
                .map(str::to_string)
                .unwrap_or_else(|| score.selected.to_string())
        })
        .collect();

    context
        .debug
        .write(id, &registration.image, &context.regions, &scores);

    Ok(ResultRow {
        file_name: id.to_string(),
        answers,
    })
}

/// Scores every file on a pool of `jobs` threads (all available cores when
/// `None`). Rows and failures keep the order of `paths`.
#[time]
pub fn process_batch(
    paths: &[PathBuf],
    context: &PipelineContext,
    jobs: Option<usize>,
) -> Result<ResultTable, ThreadPoolBuildError> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(jobs) = jobs {
        builder = builder.num_threads(jobs);
    }
    let pool = builder.build()?;

    let ids = file_ids(paths);
    let outcomes: Vec<Result<ResultRow, FileError>> = pool.install(|| {
        paths
            .par_iter()
            .zip(ids.par_iter())
            .map(|(path, id)| interpret_questionnaire(path, id, context))
            .collect()
    });

    let mut table = ResultTable::new(context.regions.question_ids().cloned().collect());
    for ((path, id), outcome) in paths.iter().zip(ids).zip(outcomes) {
        match outcome {
            Ok(row) => table.push_row(row),
            Err(error) => {
                warn!("{}: {}: {}", path.display(), error.kind(), error);
                table.push_failure(FileFailure {
                    file_name: id,
                    error,
                });
            }
        }
    }
    Ok(table)
}

fn has_raster_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            RASTER_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Lists the raster images directly inside `folder`, sorted by path, leaving
/// out any of `exclude`.
pub fn discover_candidate_files(folder: &Path, exclude: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if has_raster_extension(&path) && !exclude.iter().any(|e| same_file(&path, e)) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
