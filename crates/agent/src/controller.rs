use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionType};
use crate::bridge::DeviceHandle;
use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::handshake::resolve_device_id;
use crate::pipeline::spawn_action;
use crate::state::AgentStatus;
use common::{DeviceDoc, DeviceStatus, Filter, DEVICES};

const DEVICE_LOGS_CAP: usize = 100;

/// A device currently visible on the bridge.
#[derive(Debug, Clone)]
pub struct ObservedDevice {
    pub handle: DeviceHandle,
    /// Registry identifier, when the handshake succeeded this cycle.
    pub device_id: Option<String>,
    pub logs: VecDeque<String>,
}

impl ObservedDevice {
    pub fn new(handle: DeviceHandle) -> Self {
        Self { handle, device_id: None, logs: VecDeque::new() }
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        if self.logs.len() >= DEVICE_LOGS_CAP {
            self.logs.pop_front();
        }
        self.logs.push_back(line.into());
    }
}

/// A device the registry assigns to this agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredDevice {
    pub id: String,
    pub doc: DeviceDoc,
}

/// One device as seen by one reconciliation cycle.
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub observed: Option<ObservedDevice>,
    pub registered: Option<RegisteredDevice>,
    pub action_type: ActionType,
    pub action: Option<Arc<Action>>,
}

impl DeviceView {
    fn serial(&self) -> Option<&str> {
        self.observed.as_ref().map(|o| o.handle.serial.as_str())
    }

    fn registry_id(&self) -> Option<&str> {
        self.registered.as_ref().map(|r| r.id.as_str())
    }

    /// Same physical device as `other`, by bridge serial or registry id.
    fn same_device(&self, other: &DeviceView) -> bool {
        (self.serial().is_some() && self.serial() == other.serial())
            || (self.registry_id().is_some() && self.registry_id() == other.registry_id())
    }

    /// Bridge serial or registry id, for logs.
    pub fn label(&self) -> &str {
        self.serial().or(self.registry_id()).unwrap_or("?")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    pub auto_enroll: bool,
    pub enable_tcp: bool,
}

/// Join bridge devices with registry devices and decide one action per device.
pub fn plan(
    observed: Vec<ObservedDevice>,
    registered: Vec<RegisteredDevice>,
    policy: ReconcilePolicy,
) -> Vec<DeviceView> {
    let mut views: Vec<DeviceView> = observed
        .into_iter()
        .map(|o| DeviceView {
            observed: Some(o),
            registered: None,
            action_type: if policy.auto_enroll { ActionType::Enroll } else { ActionType::None },
            action: None,
        })
        .collect();

    for mut device in registered {
        let matched = views.iter_mut().find(|v| {
            v.observed
                .as_ref()
                .and_then(|o| o.device_id.as_deref())
                .is_some_and(|id| id == device.id)
        });
        match matched {
            Some(view) => {
                view.action_type = if device.doc.status == DeviceStatus::Offline {
                    device.doc.status = DeviceStatus::Available;
                    ActionType::UpdateStatus
                } else {
                    ActionType::None
                };
                view.registered = Some(device);
            }
            None => {
                device.doc.status = DeviceStatus::Offline;
                let action_type = if policy.enable_tcp && device.doc.known_ip().is_some() {
                    ActionType::TryConnect
                } else {
                    ActionType::None
                };
                views.push(DeviceView {
                    observed: None,
                    registered: Some(device),
                    action_type,
                    action: None,
                });
            }
        }
    }
    views
}

/// Level-triggered reconciliation of bridge devices against the registry.
pub struct Controller {
    ctx: Arc<AgentContext>,
    views: watch::Sender<Vec<DeviceView>>,
    cycle: tokio::sync::Mutex<()>,
}

impl Controller {
    pub fn new(ctx: Arc<AgentContext>) -> Arc<Self> {
        let (views, _) = watch::channel(Vec::new());
        Arc::new(Self { ctx, views, cycle: tokio::sync::Mutex::new(()) })
    }

    /// Latest published device views; new subscribers see the current snapshot first.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceView>> {
        self.views.subscribe()
    }

    pub fn snapshot(&self) -> Vec<DeviceView> {
        self.views.borrow().clone()
    }

    /// Run cycles while the agent is ready; suspend whenever it is not.
    /// In-flight actions are left to finish on their own.
    pub async fn run(self: Arc<Self>, mut status: watch::Receiver<AgentStatus>) {
        loop {
            if status.wait_for(|s| *s == AgentStatus::Ready).await.is_err() {
                return;
            }
            info!(agent=%self.ctx.agent_id, "agent ready, reconciling devices");
            let mut intv = tokio::time::interval(self.ctx.settings.reconcile_interval());
            intv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = intv.tick() => {
                        if let Err(e) = self.reconcile_once().await {
                            warn!(error=%e, "reconciliation cycle failed");
                        }
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *status.borrow_and_update() != AgentStatus::Ready {
                            info!("agent left ready state, suspending reconciliation");
                            break;
                        }
                    }
                }
            }
        }
    }

    pub async fn reconcile_once(&self) -> Result<()> {
        // serializes check-then-act across callers
        let _cycle = self.cycle.lock().await;

        let (observed, registered) = tokio::join!(self.observe(), self.registered());
        let (observed, registered) = (observed?, registered?);
        let policy = ReconcilePolicy {
            auto_enroll: self.ctx.settings.auto_enroll,
            enable_tcp: self.ctx.settings.enable_tcp,
        };
        let planned = plan(observed, registered, policy);

        let previous = self.views.borrow().clone();
        let views = self.dispatch(planned, &previous);
        debug!(devices = views.len(), "publishing device views");
        self.views.send_replace(views);
        Ok(())
    }

    async fn observe(&self) -> Result<Vec<ObservedDevice>> {
        let handles = self.ctx.bridge.list_devices().await.map_err(AgentError::Bridge)?;
        let timeout = self.ctx.settings.handshake_timeout();
        let lookups = handles.into_iter().map(|handle| async move {
            let mut device = ObservedDevice::new(handle);
            let serial = device.handle.serial.clone();
            match resolve_device_id(self.ctx.bridge.as_ref(), &serial, &self.ctx.agent_id, timeout).await {
                Ok(id) => {
                    device.push_log(format!("identity resolved: {id}"));
                    device.device_id = Some(id);
                }
                Err(e) => {
                    debug!(device=%serial, error=%e, "identity unknown this cycle");
                    device.push_log(format!("identity unknown: {e}"));
                }
            }
            device
        });
        Ok(futures::future::join_all(lookups).await)
    }

    async fn registered(&self) -> Result<Vec<RegisteredDevice>> {
        let docs = self
            .ctx
            .registry
            .query(DEVICES, &[Filter::eq("agent", self.ctx.agent_ref())])
            .await?;
        let mut devices = Vec::with_capacity(docs.len());
        for doc in docs {
            match doc.decode::<DeviceDoc>() {
                Ok(parsed) => devices.push(RegisteredDevice { id: doc.id, doc: parsed }),
                Err(e) => warn!(device=%doc.id, error=%e, "skipping undecodable device document"),
            }
        }
        Ok(devices)
    }

    fn dispatch(&self, planned: Vec<DeviceView>, previous: &[DeviceView]) -> Vec<DeviceView> {
        planned
            .into_iter()
            .map(|mut view| {
                let running = previous
                    .iter()
                    .filter(|p| p.same_device(&view))
                    .find_map(|p| p.action.as_ref().filter(|a| !a.is_terminal()).map(|a| (p.action_type, a.clone())));
                if let Some((action_type, action)) = running {
                    view.action_type = action_type;
                    view.action = Some(action);
                    return view;
                }
                if view.action_type != ActionType::None {
                    info!(device=%view.label(), action=?view.action_type, "starting device action");
                    view.action = spawn_action(
                        self.ctx.clone(),
                        view.action_type,
                        view.serial().map(str::to_string),
                        view.registered.clone(),
                    );
                }
                view
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::FakeBridge;
    use crate::bridge::ConnectionKind;
    use crate::context::testing::{context, test_settings, AGENT_ID};
    use common::registry::{fields, MemoryRegistry};
    use common::Registry;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn observed(serial: &str, id: Option<&str>) -> ObservedDevice {
        let mut d = ObservedDevice::new(DeviceHandle {
            serial: serial.to_string(),
            path: format!("usb:{serial}"),
            kind: ConnectionKind::Usb,
        });
        d.device_id = id.map(str::to_string);
        d
    }

    fn registered(id: &str, status: DeviceStatus, ip: Option<&str>) -> RegisteredDevice {
        RegisteredDevice {
            id: id.to_string(),
            doc: DeviceDoc { status, ip: ip.map(str::to_string), agent: Some(format!("agents/{AGENT_ID}")) },
        }
    }

    const ALL_ON: ReconcilePolicy = ReconcilePolicy { auto_enroll: true, enable_tcp: true };

    fn kinds(views: &[DeviceView]) -> Vec<(String, ActionType)> {
        views.iter().map(|v| (v.label().to_string(), v.action_type)).collect()
    }

    #[test]
    fn plan_covers_every_join_case() {
        let views = plan(
            vec![observed("new", None), observed("back", Some("d-back")), observed("ok", Some("d-ok"))],
            vec![
                registered("d-back", DeviceStatus::Offline, None),
                registered("d-ok", DeviceStatus::Running, None),
                registered("d-gone-ip", DeviceStatus::Available, Some("10.0.0.3")),
                registered("d-gone", DeviceStatus::Available, None),
            ],
            ALL_ON,
        );
        assert_eq!(
            kinds(&views),
            vec![
                ("new".to_string(), ActionType::Enroll),
                ("back".to_string(), ActionType::UpdateStatus),
                ("ok".to_string(), ActionType::None),
                ("d-gone-ip".to_string(), ActionType::TryConnect),
                ("d-gone".to_string(), ActionType::None),
            ]
        );
        assert_eq!(views[1].registered.as_ref().unwrap().doc.status, DeviceStatus::Available);
        assert_eq!(views[3].registered.as_ref().unwrap().doc.status, DeviceStatus::Offline);
        assert_eq!(views[4].registered.as_ref().unwrap().doc.status, DeviceStatus::Offline);
    }

    #[test]
    fn plan_respects_disabled_policies() {
        let policy = ReconcilePolicy { auto_enroll: false, enable_tcp: false };
        let views = plan(
            vec![observed("new", None)],
            vec![registered("d-gone-ip", DeviceStatus::Available, Some("10.0.0.3"))],
            policy,
        );
        assert!(views.iter().all(|v| v.action_type == ActionType::None));
    }

    #[test]
    fn plan_is_stable_for_unchanged_inputs() {
        let observed_set = vec![observed("new", None), observed("ok", Some("d-ok"))];
        let registered_set = vec![
            registered("d-ok", DeviceStatus::Offline, None),
            registered("d-gone", DeviceStatus::Available, Some("10.0.0.3")),
        ];
        let first = plan(observed_set.clone(), registered_set.clone(), ALL_ON);
        let second = plan(observed_set, registered_set, ALL_ON);
        assert_eq!(kinds(&first), kinds(&second));
    }

    #[tokio::test]
    async fn running_action_is_never_duplicated() {
        let bridge = FakeBridge::new();
        bridge.attach("R58M");
        let gate = bridge.hold_installs();
        let ctx = context(bridge.clone(), MemoryRegistry::new(), test_settings());
        let controller = Controller::new(ctx);

        controller.reconcile_once().await.unwrap();
        let first = controller.snapshot()[0].action.clone().unwrap();
        // the enroll task has to reach the device before more cycles run
        while bridge.installs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        for _ in 0..3 {
            controller.reconcile_once().await.unwrap();
            let views = controller.snapshot();
            assert_eq!(views.len(), 1);
            assert!(Arc::ptr_eq(views[0].action.as_ref().unwrap(), &first));
        }
        assert_eq!(bridge.installs.load(Ordering::SeqCst), 1);

        // once it settles, the next cycle may start a fresh one
        gate.notify_one();
        first.wait_terminal().await;
        controller.reconcile_once().await.unwrap();
        let next = controller.snapshot()[0].action.clone().unwrap();
        assert!(!Arc::ptr_eq(&next, &first));
    }

    #[tokio::test]
    async fn offline_device_back_on_bridge_is_marked_available() {
        let bridge = FakeBridge::new();
        bridge.attach("R58M");
        bridge.enrolled("R58M", "dev-1");
        let registry = MemoryRegistry::new();
        registry
            .set(DEVICES, "dev-1", fields(json!({"status": "offline", "agent": "agents/agent-1"})), false)
            .await
            .unwrap();
        let ctx = context(bridge, registry.clone(), test_settings());
        let controller = Controller::new(ctx);

        controller.reconcile_once().await.unwrap();
        let view = controller.snapshot().remove(0);
        assert_eq!(view.action_type, ActionType::UpdateStatus);
        view.action.unwrap().wait_terminal().await;

        let doc: DeviceDoc = registry.get(DEVICES, "dev-1").await.unwrap().unwrap().decode().unwrap();
        assert_eq!(doc.status, DeviceStatus::Available);

        controller.reconcile_once().await.unwrap();
        let view = controller.snapshot().remove(0);
        assert_eq!(view.action_type, ActionType::None);
        assert!(view.action.is_none());
    }

    #[tokio::test]
    async fn one_device_failing_does_not_affect_another() {
        let bridge = FakeBridge::new();
        bridge.attach("silent");
        bridge.mark_installed("silent");
        bridge.attach("good");
        bridge.enrolled("good", "dev-good");
        let registry = MemoryRegistry::new();
        registry
            .set(DEVICES, "dev-good", fields(json!({"status": "available", "agent": "agents/agent-1"})), false)
            .await
            .unwrap();
        let settings = crate::state::AgentSettings { auto_enroll: false, ..test_settings() };
        let controller = Controller::new(context(bridge, registry, settings));

        controller.reconcile_once().await.unwrap();
        let views = controller.snapshot();
        assert_eq!(views.len(), 2);
        let silent = views.iter().find(|v| v.label() == "silent").unwrap();
        assert!(silent.observed.as_ref().unwrap().device_id.is_none());
        assert!(silent.observed.as_ref().unwrap().logs[0].starts_with("identity unknown"));
        let good = views.iter().find(|v| v.label() == "good").unwrap();
        assert_eq!(good.registered.as_ref().unwrap().id, "dev-good");
        assert_eq!(good.action_type, ActionType::None);
    }

    #[tokio::test]
    async fn hung_bridge_call_does_not_stall_the_cycle() {
        let bridge = FakeBridge::new();
        bridge.attach("stuck");
        bridge.stall_install_check("stuck");
        bridge.attach("fine");
        bridge.enrolled("fine", "dev-fine");
        let registry = MemoryRegistry::new();
        registry
            .set(DEVICES, "dev-fine", fields(json!({"status": "offline", "agent": "agents/agent-1"})), false)
            .await
            .unwrap();
        let settings = crate::state::AgentSettings { auto_enroll: false, ..test_settings() };
        let controller = Controller::new(context(bridge, registry, settings));

        tokio::time::timeout(std::time::Duration::from_secs(2), controller.reconcile_once())
            .await
            .expect("cycle should finish despite a hung device")
            .unwrap();

        let views = controller.snapshot();
        assert_eq!(views.len(), 2);
        let stuck = views.iter().find(|v| v.label() == "stuck").unwrap();
        assert!(stuck.observed.as_ref().unwrap().logs[0].contains("no identity reply"));
        let fine = views.iter().find(|v| v.label() == "fine").unwrap();
        assert_eq!(fine.registered.as_ref().unwrap().id, "dev-fine");
        assert_eq!(fine.action_type, ActionType::UpdateStatus);
    }

    #[tokio::test]
    async fn devices_of_other_agents_are_ignored() {
        let registry = MemoryRegistry::new();
        registry
            .set(DEVICES, "theirs", fields(json!({"status": "available", "ip": "10.0.0.5", "agent": "agents/other"})), false)
            .await
            .unwrap();
        let controller = Controller::new(context(FakeBridge::new(), registry, test_settings()));
        controller.reconcile_once().await.unwrap();
        assert!(controller.snapshot().is_empty());
    }

    #[tokio::test]
    async fn loop_only_runs_while_ready() {
        let bridge = FakeBridge::new();
        bridge.attach("R58M");
        let _gate = bridge.hold_installs();
        let controller = Controller::new(context(bridge, MemoryRegistry::new(), test_settings()));
        let (status_tx, status_rx) = watch::channel(AgentStatus::Configuring);
        let mut views = controller.subscribe();
        let runner = tokio::spawn(controller.clone().run(status_rx));

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert!(controller.snapshot().is_empty());

        status_tx.send(AgentStatus::Ready).unwrap();
        views.changed().await.unwrap();
        assert_eq!(views.borrow().len(), 1);

        status_tx.send(AgentStatus::NotLogged).unwrap();
        drop(status_tx);
        runner.await.unwrap();
    }
}
