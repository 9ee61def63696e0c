extern crate log;
extern crate pretty_env_logger;

use std::path::PathBuf;
use std::process::exit;

use clap::{arg, command, value_parser, ArgMatches, Command};
use log::{error, info};
use thiserror::Error;

use crate::batch::{discover_candidate_files, process_batch, PipelineContext};
use crate::debug::{write_reference_crops, QuestionnaireDebugWriter};
use crate::matching::MatchFilter;
use crate::regions::build_reference_regions;
use crate::register::{Registrar, RegistrationOptions};
use crate::template::{load_template, ConfigurationError};

mod batch;
mod debug;
mod features;
mod geometry;
mod homography;
mod image_utils;
mod matching;
mod regions;
mod register;
mod results;
mod score;
mod ssim;
mod template;
#[cfg(test)]
mod test_support;
mod types;

const RESULT_DIR: &str = "Result";
const LABEL_REF_DIR: &str = "labelRef";
const DIFF_TO_REF_DIR: &str = "diffToRef";

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("unable to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("unable to write results to {path}: {source}")]
    WriteResults {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Command-line settings after merging with the template file.
#[derive(Debug, Clone)]
struct ScanOptions {
    template: PathBuf,
    folder: Option<PathBuf>,
    reference: Option<PathBuf>,
    output: Option<PathBuf>,
    jobs: Option<usize>,
    detail: bool,
    preview: bool,
    registration: RegistrationOptions,
}

impl ScanOptions {
    fn from_matches(matches: &ArgMatches) -> Self {
        let mut registration = RegistrationOptions::default();
        if let Some(&max_features) = matches.get_one::<usize>("max-features") {
            registration.orb.max_features = max_features;
        }
        if let Some(&percent) = matches.get_one::<f32>("good-match-percent") {
            registration.match_filter = MatchFilter::TopFraction(percent / 100.0);
        }
        if let Some(&distance) = matches.get_one::<u32>("max-match-distance") {
            registration.match_filter = MatchFilter::MaxDistance(distance);
        }

        Self {
            template: matches
                .get_one::<PathBuf>("template")
                .cloned()
                .unwrap_or_default(),
            folder: matches.get_one::<PathBuf>("folder").cloned(),
            reference: matches.get_one::<PathBuf>("reference").cloned(),
            output: matches.get_one::<PathBuf>("output").cloned(),
            jobs: matches.get_one::<usize>("jobs").copied(),
            detail: matches.get_flag("detail"),
            preview: !matches.get_flag("no-preview"),
            registration,
        }
    }
}

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let options = ScanOptions::from_matches(&cli().get_matches());

    match run(&options) {
        Ok(()) => {}
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            exit(1);
        }
    }
}

fn run(options: &ScanOptions) -> Result<(), RunError> {
    let template = load_template(&options.template)?;

    let reference_path = options
        .reference
        .clone()
        .unwrap_or_else(|| template.ref_form.clone());
    let folder = options
        .folder
        .clone()
        .or_else(|| template.folder.clone())
        .ok_or(ConfigurationError::MissingFolder)?;

    let reference = image::open(&reference_path)
        .map_err(|source| ConfigurationError::ReadReference {
            path: reference_path.clone(),
            source,
        })?
        .into_luma8();

    // validates every question against the reference size
    let regions = build_reference_regions(&reference, &template.questions)?;
    info!(
        "{} questions on a {}x{} reference form",
        regions.len(),
        reference.width(),
        reference.height()
    );
    write_reference_crops(&folder.join(LABEL_REF_DIR), &regions);

    let output_dir = options
        .output
        .clone()
        .unwrap_or_else(|| folder.join(RESULT_DIR));
    std::fs::create_dir_all(&output_dir).map_err(|source| RunError::WriteResults {
        path: output_dir.clone(),
        source,
    })?;

    let paths = discover_candidate_files(&folder, &[reference_path.clone()]).map_err(|source| {
        ConfigurationError::ReadFolder {
            path: folder.clone(),
            source,
        }
    })?;
    info!("{} scans found in {}", paths.len(), folder.display());

    let context = PipelineContext {
        registrar: Registrar::new(reference, options.registration.clone()),
        regions,
        debug: QuestionnaireDebugWriter::new(
            options.preview.then(|| output_dir.clone()),
            options.detail.then(|| folder.join(DIFF_TO_REF_DIR)),
        ),
    };

    let table = process_batch(&paths, &context, options.jobs)?;
    let written = table
        .write_to(&output_dir, &chrono::Local::now())
        .map_err(|source| RunError::WriteResults {
            path: output_dir.clone(),
            source,
        })?;

    info!(
        "scored {} of {} scans ({} failed)",
        table.rows().len(),
        paths.len(),
        table.failures().len()
    );
    println!("Results: {}", written.results.display());
    if let Some(failures) = &written.failures {
        println!("Failures: {}", failures.display());
    }

    Ok(())
}

#[allow(clippy::cognitive_complexity)]
fn cli() -> Command {
    command!()
        .arg(
            arg!(-t --template <PATH> "Path to the questionnaire template JSON file")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-f --folder <DIR> "Folder of scanned questionnaires, overriding the template")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-r --reference <PATH> "Reference form image, overriding the template")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-o --output <DIR> "Directory for result files [default: <folder>/Result]")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!(-j --jobs <N> "Number of worker threads [default: all cores]")
                .value_parser(value_parser!(usize)),
        )
        .arg(arg!(-d --detail "Write per-question comparison images to <folder>/diffToRef"))
        .arg(arg!(--"no-preview" "Do not write annotated preview images"))
        .arg(
            arg!(--"max-features" <N> "Maximum ORB keypoints per image [default: 500]")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            arg!(--"good-match-percent" <P> "Percentage of best matches kept [default: 70]")
                .value_parser(value_parser!(f32)),
        )
        .arg(
            arg!(--"max-match-distance" <D> "Keep matches up to this Hamming distance instead")
                .value_parser(value_parser!(u32))
                .conflicts_with("good-match-percent"),
        )
}
