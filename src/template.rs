use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{idtype, Point, Size};

idtype!(QuestionId);

/// Errors in the template definition or the reference image it points to.
/// None of these are recoverable: without a valid template nothing can be
/// scored.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unable to read template {path}: {source}")]
    ReadTemplate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse template {path}: {source}")]
    ParseTemplate {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("unable to open reference image {path}: {source}")]
    ReadReference {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("no scan folder given on the command line or in the template")]
    MissingFolder,
    #[error("unable to list scan folder {path}: {source}")]
    ReadFolder {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("template defines no questions")]
    NoQuestions,
    #[error("question {0} has no choices")]
    ZeroChoices(QuestionId),
    #[error("question {question} has {choices} choices but {labels} labels")]
    LabelCountMismatch {
        question: QuestionId,
        choices: u32,
        labels: usize,
    },
    #[error("question {0} has an empty bounding box")]
    EmptyBounds(QuestionId),
    #[error(
        "question {question} at ({x}, {y}) size {width}x{height} exceeds the {image_width}x{image_height} reference image"
    )]
    OutOfBounds {
        question: QuestionId,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
    #[error("question {question} is {width}px wide, too narrow for {choices} choices")]
    OptionTooNarrow {
        question: QuestionId,
        width: u32,
        choices: u32,
    },
}

/// The template file as written by the form designer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefinition {
    /// Directory holding the candidate scans.
    pub folder: Option<PathBuf>,
    /// Path to the unmarked reference form.
    pub ref_form: PathBuf,
    /// Questions in declared order.
    #[serde(rename = "question")]
    pub questions: QuestionLayouts,
}

/// Position and shape of a single question: `choice` equal-width boxes laid
/// side by side across `size.width`, starting at `xy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionLayout {
    pub xy: Point<u32>,
    pub size: Size<u32>,
    #[serde(rename = "choice")]
    pub choice_count: u32,
    #[serde(rename = "label")]
    pub labels: Vec<String>,
}

/// Question layouts keyed by question id, kept in the order they appear in
/// the template file. That order drives the result columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuestionLayouts(Vec<(QuestionId, QuestionLayout)>);

impl QuestionLayouts {
    pub fn new(questions: Vec<(QuestionId, QuestionLayout)>) -> Self {
        Self(questions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(QuestionId, QuestionLayout)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &QuestionId> {
        self.0.iter().map(|(id, _)| id)
    }
}

impl<'de> Deserialize<'de> for QuestionLayouts {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = QuestionLayouts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of question id to question layout")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut questions: Vec<(QuestionId, QuestionLayout)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, layout)) = map.next_entry::<String, QuestionLayout>()? {
                    if questions.iter().any(|(existing, _)| existing.as_str() == id) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate question id: {}",
                            id
                        )));
                    }
                    questions.push((QuestionId::from(id), layout));
                }
                Ok(QuestionLayouts(questions))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

impl Serialize for QuestionLayouts {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, layout) in &self.0 {
            map.serialize_entry(id.as_str(), layout)?;
        }
        map.end()
    }
}

impl QuestionLayout {
    /// Checks the layout is self-consistent and lies within an image of the
    /// given size.
    pub fn validate(
        &self,
        question: &QuestionId,
        image_size: Size<u32>,
    ) -> Result<(), ConfigurationError> {
        if self.choice_count == 0 {
            return Err(ConfigurationError::ZeroChoices(question.clone()));
        }

        if self.labels.len() != self.choice_count as usize {
            return Err(ConfigurationError::LabelCountMismatch {
                question: question.clone(),
                choices: self.choice_count,
                labels: self.labels.len(),
            });
        }

        if self.size.width == 0 || self.size.height == 0 {
            return Err(ConfigurationError::EmptyBounds(question.clone()));
        }

        let right = self.xy.x.checked_add(self.size.width);
        let bottom = self.xy.y.checked_add(self.size.height);
        match (right, bottom) {
            (Some(right), Some(bottom))
                if right <= image_size.width && bottom <= image_size.height => {}
            _ => {
                return Err(ConfigurationError::OutOfBounds {
                    question: question.clone(),
                    x: self.xy.x,
                    y: self.xy.y,
                    width: self.size.width,
                    height: self.size.height,
                    image_width: image_size.width,
                    image_height: image_size.height,
                })
            }
        }

        // every box, including the one absorbing the rounding slack, must be
        // at least one pixel wide
        let box_width = self.box_width();
        if box_width == 0 || box_width * (self.choice_count - 1) >= self.size.width {
            return Err(ConfigurationError::OptionTooNarrow {
                question: question.clone(),
                width: self.size.width,
                choices: self.choice_count,
            });
        }

        Ok(())
    }

    /// Width of every option box but the last, rounded half away from zero.
    pub fn box_width(&self) -> u32 {
        if self.choice_count == 0 {
            return 0;
        }
        (self.size.width as f64 / self.choice_count as f64).round() as u32
    }

    /// Human-readable label for the given option index.
    pub fn label(&self, option: usize) -> Option<&str> {
        self.labels.get(option).map(String::as_str)
    }
}

impl TemplateDefinition {
    /// Resolves relative `folder` and `refForm` paths against `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        if self.ref_form.is_relative() {
            self.ref_form = base.join(&self.ref_form);
        }
        self.folder = self.folder.map(|folder| {
            if folder.is_relative() {
                base.join(folder)
            } else {
                folder
            }
        });
        self
    }
}

/// Reads and parses a template file, resolving its relative paths against
/// the directory containing it.
pub fn load_template(path: &Path) -> Result<TemplateDefinition, ConfigurationError> {
    let json = std::fs::read_to_string(path).map_err(|source| ConfigurationError::ReadTemplate {
        path: path.to_path_buf(),
        source,
    })?;

    let definition: TemplateDefinition =
        serde_json::from_str(&json).map_err(|source| ConfigurationError::ParseTemplate {
            path: path.to_path_buf(),
            source,
        })?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(definition.resolve_paths(base))
}
