//! Background job scheduling

pub mod scanner;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::services::ScannerService;
use crate::services::manager::{Service, ServiceHealth};

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    scanner_service: Arc<ScannerService>,
    schedule: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let scanner = scanner_service.clone();
    let scanner_job = Job::new_async(schedule, move |_uuid, _l| {
        let scanner = scanner.clone();
        Box::pin(async move {
            info!("Running library scanner");
            if let Err(e) = scanner::run_scan(scanner).await {
                tracing::error!("Scanner error: {:#}", e);
            }
        })
    })?;
    scheduler.add(scanner_job).await?;

    scheduler.start().await?;

    info!(schedule, "Job scheduler started");
    Ok(scheduler)
}

/// Runs library scans on a cron schedule while started
pub struct ScanSchedulerService {
    scanner: Arc<ScannerService>,
    schedule: String,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl ScanSchedulerService {
    pub fn new(scanner: Arc<ScannerService>, schedule: impl Into<String>) -> Self {
        Self {
            scanner,
            schedule: schedule.into(),
            scheduler: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Service for ScanSchedulerService {
    fn name(&self) -> &str {
        "scan_scheduler"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["thumbnail_worker".to_string()]
    }

    async fn start(&self) -> Result<()> {
        let mut guard = self.scheduler.lock().await;
        if guard.is_none() {
            *guard = Some(start_scheduler(self.scanner.clone(), &self.schedule).await?);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await?;
            info!("Job scheduler stopped");
        }
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.scheduler.lock().await.is_some() {
            Ok(ServiceHealth::healthy())
        } else {
            Ok(ServiceHealth::unhealthy("Scan scheduler is stopped"))
        }
    }
}
