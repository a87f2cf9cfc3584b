//! Provider reconciler.
//!
//! Watches the two desired-state topics for this runtime (tool providers
//! and smart skills; each publish carries the full set) and converges the
//! running set onto them: stop what fell out, respawn what changed config,
//! spawn what is new. After the running set settles, the dispatcher's
//! subscription table is brought in line and discovered tools are published.
//!
//! Snapshots are processed strictly in arrival order by a single task;
//! within a snapshot stops precede spawns. Per-provider failures are logged
//! and never abort the snapshot; the failed entry stays out of the running
//! set so the next publish retries cleanly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tm_bus::{subjects, Bus};
use tm_domain::{DesiredProvider, Error, Result, Root, TransportKind};
use tm_provider::{ChatClient, ProviderRunner, SmartSkillRunner, ToolDef};
use tm_wire::{DesiredProvidersSnapshot, DesiredSkillsSnapshot, DiscoveredTool, DiscoveredTools};

use crate::dispatch::Dispatcher;

pub struct Reconciler {
    bus: Arc<dyn Bus>,
    dispatcher: Arc<Dispatcher>,
    llm: ChatClient,
    workspace_id: String,
    runtime_id: String,
    /// Running providers; owned exclusively by this reconciler.
    providers: Mutex<HashMap<String, Arc<ProviderRunner>>>,
    skills: Mutex<HashMap<String, Arc<SmartSkillRunner>>>,
    /// Discovered-tools publisher tasks, one per running provider.
    publishers: parking_lot::Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    /// Roots announced by an active stdio consumer session.
    roots: parking_lot::Mutex<Vec<Root>>,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        bus: Arc<dyn Bus>,
        dispatcher: Arc<Dispatcher>,
        llm: ChatClient,
        workspace_id: String,
        runtime_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            dispatcher,
            llm,
            workspace_id,
            runtime_id,
            providers: Mutex::new(HashMap::new()),
            skills: Mutex::new(HashMap::new()),
            publishers: parking_lot::Mutex::new(HashMap::new()),
            roots: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Attach to the desired-state topics and process snapshots until
    /// shutdown. KV watches deliver the current desired state on attach, so
    /// a restarted runtime converges immediately.
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let this = self.clone();
        tokio::spawn(async move {
            let providers_subject =
                subjects::desired_providers(&this.workspace_id, &this.runtime_id);
            let skills_subject =
                subjects::desired_smart_skills(&this.workspace_id, &this.runtime_id);

            let mut providers_watch = this
                .bus
                .kv_watch(&providers_subject)
                .await
                .map_err(|e| Error::Bus(e.to_string()))?;
            let mut skills_watch = this
                .bus
                .kv_watch(&skills_subject)
                .await
                .map_err(|e| Error::Bus(e.to_string()))?;

            tracing::info!(
                providers_subject = %providers_subject,
                skills_subject = %skills_subject,
                "reconciler watching desired state"
            );

            loop {
                tokio::select! {
                    msg = providers_watch.next() => {
                        let Some(msg) = msg else { break };
                        match serde_json::from_slice::<DesiredProvidersSnapshot>(&msg.payload) {
                            Ok(snapshot) => this.apply_provider_snapshot(snapshot).await,
                            Err(e) => tracing::warn!(error = %e, "undecodable desired-providers snapshot"),
                        }
                    }
                    msg = skills_watch.next() => {
                        let Some(msg) = msg else { break };
                        match serde_json::from_slice::<DesiredSkillsSnapshot>(&msg.payload) {
                            Ok(snapshot) => this.apply_skill_snapshot(snapshot).await,
                            Err(e) => tracing::warn!(error = %e, "undecodable desired-skills snapshot"),
                        }
                    }
                    _ = this.cancel.cancelled() => break,
                }
            }
            Ok(())
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Providers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn apply_provider_snapshot(&self, snapshot: DesiredProvidersSnapshot) {
        let desired: HashMap<String, DesiredProvider> = snapshot
            .providers
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut running = self.providers.lock().await;
        tracing::debug!(
            desired = desired.len(),
            running = running.len(),
            "applying provider snapshot"
        );

        // Stops first, so a respawn is always stop → start.
        let stop_ids: Vec<String> = running
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in stop_ids {
            self.stop_provider(&mut running, &id).await;
        }

        let root_count = self.roots.lock().len();
        for (id, record) in desired {
            if let Some(existing) = running.get(&id) {
                if existing.config_signature() == record.config_signature(root_count) {
                    continue;
                }
                tracing::info!(provider_id = %id, "config signature changed, respawning");
                self.stop_provider(&mut running, &id).await;
            }

            let roots = self.roots.lock().clone();
            match ProviderRunner::start(record, roots).await {
                Ok(runner) => {
                    if let Err(e) = self.dispatcher.ensure_tools_subscribed(runner.clone()).await {
                        tracing::warn!(provider_id = %id, error = %e, "tool subscription failed");
                        runner.stop().await;
                        continue;
                    }
                    self.spawn_discovered_publisher(&id, runner.tools());
                    running.insert(id, runner);
                }
                Err(e) => {
                    tracing::warn!(provider_id = %id, error = %e, "provider spawn failed, skipping");
                }
            }
        }
    }

    async fn stop_provider(
        &self,
        running: &mut HashMap<String, Arc<ProviderRunner>>,
        id: &str,
    ) {
        if let Some(task) = self.publishers.lock().remove(id) {
            task.abort();
        }
        if let Some(runner) = running.remove(id) {
            runner.stop().await;
        }
        self.dispatcher.unsubscribe_all(id).await;
    }

    /// Publish the provider's catalog now and on every change. The runner
    /// already suppresses no-op emissions by digest.
    fn spawn_discovered_publisher(
        &self,
        provider_id: &str,
        mut tools: tokio::sync::watch::Receiver<Vec<ToolDef>>,
    ) {
        let bus = self.bus.clone();
        let subject = subjects::discovered_tools(&self.workspace_id, provider_id);
        let id_for_task = provider_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                let discovered: Vec<DiscoveredTool> = tools
                    .borrow_and_update()
                    .iter()
                    .map(|t| DiscoveredTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.input_schema.clone(),
                        annotations: t.annotations.clone().unwrap_or_default(),
                    })
                    .collect();
                let message = DiscoveredTools {
                    provider_id: id_for_task.clone(),
                    tools: discovered,
                };
                match serde_json::to_vec(&message) {
                    Ok(payload) => {
                        if let Err(e) = bus.publish(&subject, payload).await {
                            tracing::warn!(error = %e, "discovered-tools publish failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "discovered-tools serialize failed"),
                }
                if tools.changed().await.is_err() {
                    break;
                }
            }
        });
        self.publishers.lock().insert(provider_id.to_string(), task);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Smart skills
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn apply_skill_snapshot(&self, snapshot: DesiredSkillsSnapshot) {
        let desired: HashMap<String, _> = snapshot
            .skills
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let mut running = self.skills.lock().await;

        let stop_ids: Vec<String> = running
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in stop_ids {
            running.remove(&id);
            self.dispatcher.unsubscribe_skill(&id).await;
            tracing::info!(skill_id = %id, "smart skill stopped");
        }

        for (id, record) in desired {
            if let Some(existing) = running.get(&id) {
                if existing.config_signature() == record.config_signature() {
                    continue;
                }
                tracing::info!(skill_id = %id, "skill config changed, replacing");
                running.remove(&id);
                self.dispatcher.unsubscribe_skill(&id).await;
            }

            let runner = Arc::new(SmartSkillRunner::new(record, self.llm.clone()));
            match self.dispatcher.ensure_skill_subscribed(runner.clone()).await {
                Ok(()) => {
                    running.insert(id, runner);
                }
                Err(e) => {
                    tracing::warn!(skill_id = %id, error = %e, "skill subscription failed, skipping");
                }
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Roots & shutdown
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Roots announced by the stdio consumer session replace the advertised
    /// roots of every running stdio provider on the fly.
    pub async fn update_roots(&self, roots: Vec<Root>) {
        *self.roots.lock() = roots.clone();
        let running = self.providers.lock().await;
        for runner in running.values() {
            if runner.desired().transport != TransportKind::Stdio {
                continue;
            }
            if let Err(e) = runner.update_roots(roots.clone()).await {
                tracing::warn!(provider_id = %runner.id(), error = %e, "root update failed");
            }
        }
    }

    /// Stop everything. Errors are tolerated per provider.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let mut running = self.providers.lock().await;
        let ids: Vec<String> = running.keys().cloned().collect();
        for id in ids {
            self.stop_provider(&mut running, &id).await;
        }

        let mut skills = self.skills.lock().await;
        let ids: Vec<String> = skills.keys().cloned().collect();
        for id in ids {
            skills.remove(&id);
            self.dispatcher.unsubscribe_skill(&id).await;
        }
        tracing::info!("reconciler shut down");
    }

    // ── Test observability ──────────────────────────────────────────

    pub async fn running_provider(&self, id: &str) -> Option<Arc<ProviderRunner>> {
        self.providers.lock().await.get(id).cloned()
    }

    pub async fn running_provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn running_skill(&self, id: &str) -> Option<Arc<SmartSkillRunner>> {
        self.skills.lock().await.get(id).cloned()
    }
}
