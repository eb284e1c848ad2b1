//! Dependency resolution for modules loaded from plugin directories.
//!
//! Lookups a module cannot satisfy through the normal search path go through
//! a [`ResolverChain`]: a stack of resolvers where each one may answer or
//! hand the request to the resolvers installed before it.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::module::{Module, ModuleBackend, ModuleId, ModuleImage, ModuleTable};

/// A dependency lookup.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// Requested module name, without extension.
    pub name: &'a str,
    /// Module that issued the lookup.
    pub owner: ModuleId,
}

/// One link in the resolver chain.
pub trait Resolver: Send + Sync {
    /// Resolve `request`, or pass it on through `next`.
    fn resolve(&self, request: &ResolveRequest<'_>, next: Next<'_>) -> Result<Arc<dyn Module>>;
}

/// The resolvers installed below the current one.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Resolver>],
    chain: &'a ResolverChain,
}

impl<'a> Next<'a> {
    /// Delegate to the previously installed resolver.
    pub fn resolve(self, request: &ResolveRequest<'_>) -> Result<Arc<dyn Module>> {
        match self.remaining.split_last() {
            Some((resolver, rest)) => resolver.resolve(
                request,
                Next {
                    remaining: rest,
                    chain: self.chain,
                },
            ),
            None => Err(Error::DependencyNotResolved {
                name: request.name.to_string(),
                owner: request.owner,
            }),
        }
    }

    /// The whole chain, for lookups issued by modules linked while resolving.
    pub fn chain(&self) -> &'a ResolverChain {
        self.chain
    }
}

/// Token identifying one installed resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolverToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Prioritized stack of resolvers; the most recently pushed runs first.
#[derive(Default)]
pub struct ResolverChain {
    stack: RwLock<Vec<(ResolverToken, Arc<dyn Resolver>)>>,
}

impl ResolverChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `resolver` on top of the chain.
    pub fn push(&self, resolver: Arc<dyn Resolver>) -> ResolverToken {
        let token = ResolverToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        self.stack.write().push((token, resolver));
        token
    }

    /// Remove the resolver installed with `token`, leaving every other
    /// resolver in place. Returns false if it was not installed.
    pub fn release(&self, token: ResolverToken) -> bool {
        let mut stack = self.stack.write();
        match stack.iter().position(|(t, _)| *t == token) {
            Some(index) => {
                if index + 1 != stack.len() {
                    tracing::warn!("Releasing a resolver that is not on top of the chain");
                }
                stack.remove(index);
                true
            }
            None => false,
        }
    }

    /// Resolve `request` starting from the top of the chain.
    pub fn resolve(&self, request: &ResolveRequest<'_>) -> Result<Arc<dyn Module>> {
        // Resolvers may link modules that issue lookups of their own, so the
        // lock is not held while they run.
        let snapshot: Vec<Arc<dyn Resolver>> =
            self.stack.read().iter().map(|(_, r)| r.clone()).collect();
        Next {
            remaining: &snapshot,
            chain: self,
        }
        .resolve(request)
    }

    /// Number of installed resolvers.
    pub fn len(&self) -> usize {
        self.stack.read().len()
    }

    /// Check if no resolver is installed.
    pub fn is_empty(&self) -> bool {
        self.stack.read().is_empty()
    }
}

impl std::fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverChain")
            .field("resolvers", &self.len())
            .finish()
    }
}

/// Dependency lookups on behalf of one module being linked.
pub struct DependencyScope<'a> {
    owner: ModuleId,
    chain: &'a ResolverChain,
}

impl<'a> DependencyScope<'a> {
    /// Scope for lookups issued by `owner`.
    pub fn new(owner: ModuleId, chain: &'a ResolverChain) -> Self {
        Self { owner, chain }
    }

    /// Module the lookups are issued for.
    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    /// Resolve the dependency `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.chain.resolve(&ResolveRequest {
            name,
            owner: self.owner,
        })
    }
}

/// Resolves a module's dependencies from files beside the module itself.
pub struct SiblingResolver {
    modules: Arc<ModuleTable>,
    backend: Arc<dyn ModuleBackend>,
}

impl SiblingResolver {
    /// Create a resolver over the loader's module table.
    pub fn new(modules: Arc<ModuleTable>, backend: Arc<dyn ModuleBackend>) -> Self {
        Self { modules, backend }
    }
}

impl Resolver for SiblingResolver {
    fn resolve(&self, request: &ResolveRequest<'_>, next: Next<'_>) -> Result<Arc<dyn Module>> {
        let Some(owner) = self.modules.latest(request.owner) else {
            tracing::trace!("{} is not a live module, passing `{}` on", request.owner, request.name);
            return next.resolve(request);
        };

        let directory = owner.source_path.parent().unwrap_or(Path::new(""));
        let sibling = directory.join(format!("{}.{}", request.name, self.backend.extension()));

        if !sibling.is_file() {
            tracing::warn!("Dependency not found beside plugin: {}", sibling.display());
            return next.resolve(request);
        }

        tracing::info!(
            "Loading dependency {} for {}",
            sibling.display(),
            owner.source_path.display()
        );

        let bytes = std::fs::read(&sibling)?;
        let id = ModuleId::next();
        self.modules.stage(id, &sibling);

        let image = ModuleImage {
            id,
            path: sibling,
            bytes,
            symbols: None,
        };
        let module = self
            .backend
            .load(image, &DependencyScope::new(id, next.chain()))?;
        self.modules.retain(id, module.clone());

        Ok(module)
    }
}
