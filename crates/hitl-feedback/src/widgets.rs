//! Objective form widgets: how a rater enters a score.

use hitl_optimizer::Study;
use hitl_types::{FeedbackError, HitlError, HitlResult};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const WIDGETS_ATTR_KEY: &str = "dashboard:objective_form_widgets";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectiveFormWidget {
    /// Fixed labelled choices, each mapped to an objective value.
    Choice {
        description: String,
        choices: Vec<String>,
        values: Vec<f64>,
    },
    Slider {
        description: String,
        min: f64,
        max: f64,
        step: Option<f64>,
    },
}

/// A rater's answer to a widget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WidgetResponse {
    Choice(usize),
    Value(f64),
}

fn invalid(message: impl Into<String>) -> FeedbackError {
    FeedbackError::InvalidWidget {
        message: message.into(),
    }
}

impl ObjectiveFormWidget {
    /// The three-way rating used by the color study. "Good" maps to the
    /// lowest value because the study minimizes.
    pub fn rating() -> Self {
        Self::Choice {
            description: "Please input your score!".to_string(),
            choices: vec!["Good 👍".to_string(), "So-so👌".to_string(), "Bad 👎".to_string()],
            values: vec![-1.0, 0.0, 1.0],
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Choice { description, .. } | Self::Slider { description, .. } => description,
        }
    }

    pub fn validate(&self) -> HitlResult<()> {
        match self {
            Self::Choice {
                choices, values, ..
            } => {
                if choices.is_empty() {
                    return Err(invalid("choice widget needs at least one choice").into());
                }
                if choices.len() != values.len() {
                    return Err(invalid(format!(
                        "{} choices but {} values",
                        choices.len(),
                        values.len()
                    ))
                    .into());
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(invalid("choice values must be finite").into());
                }
            }
            Self::Slider { min, max, step, .. } => {
                if !(min.is_finite() && max.is_finite() && min < max) {
                    return Err(invalid(format!("slider range [{min}, {max}] is empty")).into());
                }
                if let Some(step) = step {
                    if !(step.is_finite() && *step > 0.0) {
                        return Err(invalid(format!("slider step {step} must be positive")).into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Objective value for `response`.
    pub fn resolve(&self, response: &WidgetResponse) -> HitlResult<f64> {
        match (self, *response) {
            (Self::Choice { values, .. }, WidgetResponse::Choice(index)) => values
                .get(index)
                .copied()
                .ok_or_else(|| {
                    HitlError::from(FeedbackError::ChoiceOutOfRange {
                        index,
                        len: values.len(),
                    })
                }),
            (Self::Slider { min, max, .. }, WidgetResponse::Value(value)) => {
                if value.is_finite() && (*min..=*max).contains(&value) {
                    Ok(value)
                } else {
                    Err(FeedbackError::ValueOutOfRange {
                        value,
                        min: *min,
                        max: *max,
                    }
                    .into())
                }
            }
            (Self::Choice { .. }, WidgetResponse::Value(_)) => Err(FeedbackError::ResponseMismatch {
                message: "choice widget expects a choice index".to_string(),
            }
            .into()),
            (Self::Slider { .. }, WidgetResponse::Choice(_)) => Err(FeedbackError::ResponseMismatch {
                message: "slider widget expects a value".to_string(),
            }
            .into()),
        }
    }
}

/// Attach the score-entry widgets to `study`, one per metric name.
pub fn register_objective_form_widgets(study: &Study, widgets: &[ObjectiveFormWidget]) -> HitlResult<()> {
    let metric_names = study.metric_names()?;
    let expected = metric_names.len().max(1);
    if widgets.len() != expected {
        return Err(FeedbackError::WidgetCountMismatch {
            expected,
            actual: widgets.len(),
        }
        .into());
    }
    for widget in widgets {
        widget.validate()?;
    }
    study.set_study_attr(WIDGETS_ATTR_KEY, serde_json::to_value(widgets)?)?;
    info!(study = %study.name(), count = widgets.len(), "objective form widgets registered");
    Ok(())
}

pub fn registered_widgets(study: &Study) -> HitlResult<Vec<ObjectiveFormWidget>> {
    let attrs = study.study_attrs()?;
    let value = attrs
        .get(WIDGETS_ATTR_KEY)
        .ok_or_else(|| FeedbackError::WidgetsNotRegistered {
            study: study.name().to_string(),
        })?;
    Ok(serde_json::from_value(value.clone())?)
}
