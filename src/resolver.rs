//! Dependency resolver (component D). Generalizes the teacher's
//! `DependencyResolver::resolve_dependencies` BFS into a flat-graph resolver that
//! matches spec.md §4.D's invariants: first-writer-wins with a warning on later
//! incompatible demands, a `resolving` cycle guard of `name@range` keys, a depth
//! guard, and `dist-tags` resolution ahead of semver parsing.

use crate::registry::RegistryClient;
use crate::semver::{Range, Version};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;

const MAX_DEPTH: usize = 50;

#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: Version,
    pub tarball_url: String,
    pub integrity: Option<String>,
    pub shasum: Option<String>,
    pub dependencies: HashMap<String, String>,
    pub bin: HashMap<String, String>,
}

pub struct Resolver {
    registry: RegistryClient,
    packument_cache: HashMap<String, crate::registry::Packument>,
    pub warnings: Vec<String>,
}

impl Resolver {
    pub fn new(registry: RegistryClient) -> Self {
        Self {
            registry,
            packument_cache: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Clears the packument cache, bounding memory between resolves (spec.md §5).
    pub fn reset_cache(&mut self) {
        self.packument_cache.clear();
    }

    async fn packument(&mut self, name: &str) -> Result<crate::registry::Packument, Box<dyn Error + Send + Sync>> {
        if let Some(cached) = self.packument_cache.get(name) {
            return Ok(cached.clone());
        }
        let packument = self.registry.fetch_packument(name).await?;
        self.packument_cache.insert(name.to_string(), packument.clone());
        Ok(packument)
    }

    fn resolve_range_str(range_str: &str, packument: &crate::registry::Packument) -> Range {
        let trimmed = range_str.trim();
        if trimmed == "latest" {
            if let Some(tagged) = packument.dist_tags.get("latest") {
                return Range::parse(tagged);
            }
        }
        Range::parse(trimmed)
    }

    async fn resolve_one(
        &mut self,
        name: &str,
        range_str: &str,
    ) -> Result<ResolvedPackage, Box<dyn Error + Send + Sync>> {
        let packument = self.packument(name).await?;
        let range = Self::resolve_range_str(range_str, &packument);

        let available: Vec<Version> = packument
            .versions
            .keys()
            .filter_map(|v| Version::parse(v))
            .collect();

        let chosen = range
            .max_satisfying(available.iter())
            .ok_or_else(|| format!("no version of {name} satisfies {range_str}"))?;

        let meta = packument
            .versions
            .get(&chosen.to_string())
            .ok_or("resolved version missing from packument")?;

        let bin = match &meta.bin {
            Some(serde_json::Value::String(single)) => {
                let mut map = HashMap::new();
                map.insert(default_bin_name(name), single.clone());
                map
            }
            Some(serde_json::Value::Object(obj)) => obj
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => HashMap::new(),
        };

        let mut dependencies = meta.dependencies.clone();
        dependencies.extend(meta.peer_dependencies.clone());
        dependencies.extend(meta.optional_dependencies.clone());

        Ok(ResolvedPackage {
            name: name.to_string(),
            version: chosen,
            tarball_url: meta.dist.tarball.clone(),
            integrity: meta.dist.integrity.clone(),
            shasum: meta.dist.shasum.clone(),
            dependencies,
            bin,
        })
    }

    /// Resolves the full dependency graph for a package.json-style dependency map.
    pub async fn resolve(
        &mut self,
        root_dependencies: &HashMap<String, String>,
    ) -> Result<HashMap<String, ResolvedPackage>, Box<dyn Error + Send + Sync>> {
        let mut resolved: HashMap<String, ResolvedPackage> = HashMap::new();
        let mut resolving: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, String, usize)> = VecDeque::new();

        for (name, range) in root_dependencies {
            queue.push_back((name.clone(), range.clone(), 0));
        }

        while let Some((name, range_str, depth)) = queue.pop_front() {
            if depth > MAX_DEPTH {
                self.warnings
                    .push(format!("max depth exceeded resolving {name}, skipping"));
                continue;
            }

            let cycle_key = format!("{name}@{range_str}");
            if resolving.contains(&cycle_key) {
                continue;
            }

            if let Some(existing) = resolved.get(&name) {
                let range = Range::parse(&range_str);
                if range.satisfies(&existing.version) {
                    continue;
                }
                self.warnings.push(format!(
                    "version conflict for {name}: kept {} but {range_str} was also requested",
                    existing.version
                ));
                continue;
            }

            resolving.insert(cycle_key.clone());
            let package = match self.resolve_one(&name, &range_str).await {
                Ok(p) => p,
                Err(err) => {
                    self.warnings.push(format!("failed to resolve {name}: {err}"));
                    resolving.remove(&cycle_key);
                    continue;
                }
            };
            resolving.remove(&cycle_key);

            for (dep_name, dep_range) in &package.dependencies {
                queue.push_back((dep_name.clone(), dep_range.clone(), depth + 1));
            }

            resolved.insert(name, package);
        }

        Ok(resolved)
    }
}

fn default_bin_name(package_name: &str) -> String {
    package_name.rsplit('/').next().unwrap_or(package_name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Dist, Packument, VersionMeta};

    fn packument_with(versions: &[(&str, &[(&str, &str)])]) -> Packument {
        let mut map = HashMap::new();
        for (v, deps) in versions {
            map.insert(
                v.to_string(),
                VersionMeta {
                    dependencies: deps.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                    peer_dependencies: HashMap::new(),
                    optional_dependencies: HashMap::new(),
                    dist: Dist {
                        tarball: format!("https://example.test/{v}.tgz"),
                        integrity: None,
                        shasum: None,
                    },
                    bin: None,
                },
            );
        }
        Packument {
            versions: map,
            dist_tags: HashMap::new(),
        }
    }

    #[test]
    fn resolve_range_prefers_dist_tag_for_latest() {
        let packument = packument_with(&[("1.0.0", &[]), ("2.0.0", &[])]);
        let mut tags = HashMap::new();
        tags.insert("latest".to_string(), "1.0.0".to_string());
        let packument = Packument {
            dist_tags: tags,
            ..packument
        };
        let range = Resolver::resolve_range_str("latest", &packument);
        let versions: Vec<Version> = packument.versions.keys().filter_map(|v| Version::parse(v)).collect();
        assert_eq!(range.max_satisfying(versions.iter()).unwrap().to_string(), "1.0.0");
    }
}
