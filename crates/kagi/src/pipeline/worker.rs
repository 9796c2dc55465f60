use std::{num::NonZeroU32, path::PathBuf, sync::Arc};

use tokio::sync::{mpsc, Semaphore};

use crate::{
    crypt,
    error::{KagiError, KagiResult},
    key::KeyMaterial,
    util::Fingerprint,
};

#[derive(Debug, Clone)]
pub(crate) struct EncryptJob {
    pub file_name: String,
    pub sequence: u64,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
}

#[derive(Debug)]
pub(crate) enum WorkerReport {
    Encrypted {
        file_name: String,
        fingerprint: Fingerprint,
    },
    Failed {
        file_name: String,
        error: KagiError,
    },
}

/// Encrypts segments on the blocking thread pool, at most `concurrency` at a time.
///
/// Workers never touch pipeline state. Every job ends with exactly one
/// [`WorkerReport`] on the report channel.
pub(crate) struct WorkerPool {
    key: Arc<KeyMaterial>,
    concurrency: NonZeroU32,
    permits: Arc<Semaphore>,
    reports: mpsc::UnboundedSender<WorkerReport>,
}

impl WorkerPool {
    pub fn new(
        key: Arc<KeyMaterial>,
        concurrency: NonZeroU32,
        reports: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        Self {
            key,
            concurrency,
            permits: Arc::new(Semaphore::new(concurrency.get() as usize)),
            reports,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.concurrency.get() as usize - self.permits.available_permits()
    }

    /// Start encrypting `job`, waiting for a free worker first.
    pub async fn dispatch(&self, job: EncryptJob) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                log::error!("Worker pool is closed, dropping {}. {e}", job.file_name);
                return;
            }
        };

        let key = self.key.clone();
        let reports = self.reports.clone();
        tokio::spawn(async move {
            let file_name = job.file_name.clone();
            log::debug!("Encrypting {file_name} with IV of sequence {}.", job.sequence);

            let report = match encrypt(job, key).await {
                Ok(fingerprint) => WorkerReport::Encrypted {
                    file_name,
                    fingerprint,
                },
                Err(error) => WorkerReport::Failed { file_name, error },
            };
            // report before releasing the permit, so a drained pool has nothing left to say
            _ = reports.send(report);
            drop(permit);
        });
    }

    /// Wait for every running job to finish.
    pub async fn drain(&self) {
        match self.permits.acquire_many(self.concurrency.get()).await {
            Ok(all) => drop(all),
            Err(e) => log::error!("Failed to wait for workers: {e}"),
        }
    }
}

async fn encrypt(job: EncryptJob, key: Arc<KeyMaterial>) -> KagiResult<Fingerprint> {
    tokio::task::spawn_blocking(move || {
        crypt::encrypt_file(&job.source_path, &job.dest_path, &key, job.sequence)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypt::decrypt_segment, key::IvMode};

    fn job(dir: &std::path::Path, name: &str, sequence: u64) -> EncryptJob {
        EncryptJob {
            file_name: name.to_string(),
            sequence,
            source_path: dir.join("src").join(name),
            dest_path: dir.join("dst").join(name),
        }
    }

    #[tokio::test]
    async fn test_pool_reports_every_job() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("dst")).unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("src/index00{i}.m4s")), [i as u8; 100]).unwrap();
        }

        let key = Arc::new(KeyMaterial::new([9; 16], "k", IvMode::SequenceDerived));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(key, NonZeroU32::new(2).unwrap(), tx);

        for i in 0..4 {
            pool.dispatch(job(dir.path(), &format!("index00{i}.m4s"), i)).await;
        }
        // this one does not exist
        pool.dispatch(job(dir.path(), "index009.m4s", 9)).await;
        pool.drain().await;
        assert_eq!(pool.in_flight(), 0);

        let mut encrypted = 0;
        let mut failed = Vec::new();
        while let Ok(report) = rx.try_recv() {
            match report {
                WorkerReport::Encrypted { fingerprint, .. } => {
                    assert_eq!(fingerprint.len, 100);
                    encrypted += 1;
                }
                WorkerReport::Failed { file_name, .. } => failed.push(file_name),
            }
        }
        assert_eq!(encrypted, 4);
        assert_eq!(failed, ["index009.m4s"]);

        let data = std::fs::read(dir.path().join("dst/index002.m4s")).unwrap();
        let plain = decrypt_segment(&data, &[9; 16], &2u128.to_be_bytes()).unwrap();
        assert_eq!(plain, [2u8; 100]);
    }
}
