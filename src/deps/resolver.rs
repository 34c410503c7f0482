use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::deps::policy;
use crate::deps::uri::{self, DependencyUri};
use crate::error::{ExecutionError, Result};
use crate::hashing;
use crate::job::request::RunnerJob;

/// A resolved artifact: where it came from and where it lives locally.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub uri: DependencyUri,
    pub path: PathBuf,
}

/// Collaborator that materializes dependency URIs as local files. Maven
/// and direct-URL schemes are supported; how artifacts are fetched is the
/// implementation's concern.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, uris: &BTreeSet<DependencyUri>) -> Result<Vec<Artifact>>;

    /// Local cache root, mounted into containerized workers.
    fn local_cache_dir(&self) -> &Path;
}

/// Resolves a job's dependency set: normalizes URIs, defers to the
/// artifact resolver, applies the payload's dependency policy and returns
/// a stable, sorted path list.
pub struct DependencyResolver<R> {
    resolver: R,
    default_dependencies: Vec<String>,
    http: reqwest::Client,
}

impl<R: ArtifactResolver> DependencyResolver<R> {
    pub fn new(resolver: R, default_dependencies: Vec<String>) -> Self {
        Self {
            resolver,
            default_dependencies,
            http: uri::probe_client(),
        }
    }

    pub fn artifact_resolver(&self) -> &R {
        &self.resolver
    }

    pub async fn resolve(&self, job: &RunnerJob) -> Result<Vec<PathBuf>> {
        let started = Instant::now();

        let mut raw: BTreeSet<&str> =
            self.default_dependencies.iter().map(String::as_str).collect();
        raw.extend(job.cfg.dependencies.iter().map(String::as_str));

        let mut uris = BTreeSet::new();
        for s in &raw {
            uris.insert(uri::normalize(&self.http, s).await?);
        }

        let artifacts = self.resolver.resolve(&uris).await?;
        self.check_policy(job, &artifacts)?;

        let mut paths: Vec<PathBuf> = artifacts.into_iter().map(|a| a.path).collect();
        paths.sort();

        if job.debug_mode {
            job.log.info(&format!(
                "Dependency resolution took {}ms",
                started.elapsed().as_millis()
            ));
            log_dependencies(job, paths.iter().map(|p| p.display().to_string()));
        } else {
            log_dependencies(job, uris.iter().map(|u| u.to_string()));
        }

        Ok(paths)
    }

    fn check_policy(&self, job: &RunnerJob, artifacts: &[Artifact]) -> Result<()> {
        let rules = match policy::load(&job.payload_dir)? {
            Some(rules) if !rules.is_empty() => rules,
            _ => return Ok(()),
        };

        job.log.info("Checking the dependency policy...");

        let result = rules.check(artifacts);
        for v in &result.warn {
            job.log.info(&format!(
                "Potentially restricted artifact '{}' (dependency policy: {})",
                v.artifact.uri, v.rule
            ));
        }
        for v in &result.deny {
            job.log.info(&format!(
                "Artifact '{}' is forbidden by the dependency policy {}",
                v.artifact.uri, v.rule
            ));
        }
        if !result.deny.is_empty() {
            return Err(ExecutionError::ForbiddenDependencies);
        }
        Ok(())
    }
}

fn log_dependencies(job: &RunnerJob, deps: impl Iterator<Item = String>) {
    let deps: Vec<String> = deps.collect();
    if deps.is_empty() {
        job.log.info("No external dependencies.");
        return;
    }
    let mut message = String::from("Dependencies:");
    for dep in &deps {
        message.push_str("\n\t");
        message.push_str(dep);
    }
    job.log.info(&message);
}

/// Minimal resolver for direct-URL artifacts: downloads each URL into the
/// cache directory under a content-addressed name. Maven coordinates need
/// a repository-aware resolver and are rejected here.
pub struct HttpArtifactResolver {
    cache_dir: PathBuf,
    http: reqwest::Client,
}

impl HttpArtifactResolver {
    pub fn new(cache_dir: PathBuf) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to create the artifact download client");
        Self { cache_dir, http }
    }

    async fn fetch(&self, url: &str) -> Result<PathBuf> {
        let path = self.cache_dir.join(cached_name(url));
        if path.exists() {
            return Ok(path);
        }

        tracing::info!(url, path = %path.display(), "downloading a dependency artifact");
        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}

#[async_trait]
impl ArtifactResolver for HttpArtifactResolver {
    async fn resolve(&self, uris: &BTreeSet<DependencyUri>) -> Result<Vec<Artifact>> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let mut artifacts = Vec::with_capacity(uris.len());
        for uri in uris {
            match uri {
                DependencyUri::Maven(s) => {
                    return Err(ExecutionError::DependencyResolution(format!(
                        "no Maven repository resolver configured for {s}"
                    )));
                }
                DependencyUri::Url(url) => {
                    let path = self.fetch(url).await?;
                    artifacts.push(Artifact {
                        uri: uri.clone(),
                        path,
                    });
                }
            }
        }
        Ok(artifacts)
    }

    fn local_cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

fn cached_name(url: &str) -> String {
    let digest = hashing::sha256_hex([url]);
    let segment = url
        .rsplit('/')
        .next()
        .and_then(|s| s.split('?').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("artifact");
    format!("{}-{}", &digest[..16], segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_names_are_stable_and_distinct() {
        let a = cached_name("https://host/libs/a.jar");
        assert_eq!(a, cached_name("https://host/libs/a.jar"));
        assert!(a.ends_with("-a.jar"));
        assert_ne!(a, cached_name("https://host/libs/b.jar"));
    }

    #[test]
    fn cached_name_handles_query_strings_and_bare_hosts() {
        assert!(cached_name("https://host/a.jar?token=x").ends_with("-a.jar"));
        assert!(cached_name("https://host/").ends_with("-artifact"));
    }
}
