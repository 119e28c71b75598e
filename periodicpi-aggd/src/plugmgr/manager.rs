use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use super::descriptor::{MethodDescriptor, Module, ModuleClass, ModuleDescriptor, PropertyDescriptor};
use super::hook::{HookAction, HookHandler, HookTable};
use super::{Kwargs, ManagerError, ManagerResult};

pub type CustomMethod = Arc<dyn Fn(&Kwargs) -> ManagerResult<Value> + Send + Sync>;

/// A loaded driver instance and the arguments it was built with.
pub struct LoadedModuleInstance {
    id: String,
    class: Arc<ModuleClass>,
    args: Kwargs,
    /// Load order, used to unload newest first on shutdown
    serial: u64,
    /// Taken out once the unload routine has run
    driver: Mutex<Option<Box<dyn Module>>>,
    retired: AtomicBool,
}

impl LoadedModuleInstance {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.class.descriptor
    }

    /// Run `f` against the driver. If the instance was retired while `f`
    /// ran, the deferred unload happens here once the driver is free.
    fn with_driver<T>(&self, f: impl FnOnce(&mut Box<dyn Module>) -> ManagerResult<T>) -> ManagerResult<T> {
        let result = match self.driver.lock().as_mut() {
            Some(driver) => f(driver),
            None => Err(ManagerError::ModuleNotLoaded(self.id.clone())),
        };
        if self.retired.load(Ordering::SeqCst) {
            self.finish_unload();
        }
        result
    }

    /// Mark the instance retired and unload it unless a call is in flight,
    /// in which case that call finishes the unload on its way out.
    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.finish_unload();
    }

    fn finish_unload(&self) {
        let driver = match self.driver.try_lock() {
            Some(mut slot) => slot.take(),
            None => return,
        };
        if let Some(mut driver) = driver {
            driver.unload();
            tracing::debug!("Unload routine of \"{}\" finished", self.id);
        }
    }
}

/// Instance table entry. Ids are reserved before the factory runs so that a
/// concurrent or re-entrant load cannot claim the same name.
enum Slot {
    Loading,
    Ready(Arc<LoadedModuleInstance>),
    Unloading,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, Slot>,
    /// Highest suffix ever issued per base name; present once the bare name was used
    issued: HashMap<String, u32>,
    hooks: HookTable,
    next_serial: u64,
}

impl State {
    fn reserve(&mut self, descriptor: &ModuleDescriptor) -> ManagerResult<String> {
        let base = &descriptor.name;

        let id = if !descriptor.allows_multiple_instances() {
            if self.instances.contains_key(base) {
                return Err(ManagerError::ModuleAlreadyLoaded(base.clone()));
            }
            self.issued.entry(base.clone()).or_insert(0);
            base.clone()
        } else {
            match self.issued.get_mut(base) {
                Some(last) => {
                    *last += 1;
                    format!("{}-{}", base, last)
                }
                None => {
                    self.issued.insert(base.clone(), 0);
                    base.clone()
                }
            }
        };

        if self.instances.contains_key(&id) {
            return Err(ManagerError::ModuleAlreadyLoaded(id));
        }
        self.instances.insert(id.clone(), Slot::Loading);
        Ok(id)
    }

    fn ready(&self, id: &str) -> ManagerResult<Arc<LoadedModuleInstance>> {
        match self.instances.get(id) {
            Some(Slot::Ready(instance)) => Ok(instance.clone()),
            _ => Err(ManagerError::ModuleNotLoaded(id.to_string())),
        }
    }
}

struct Inner {
    catalog: RwLock<BTreeMap<String, Arc<ModuleClass>>>,
    methods: RwLock<HashMap<String, CustomMethod>>,
    state: Mutex<State>,
    devices: Mutex<HashMap<String, DeviceRegistry>>,
}

/// Central registry of driver descriptors, loaded instances, hooks and
/// custom methods.
///
/// Cloning is cheap and every clone refers to the same manager. Locks are
/// only held while the in-memory tables are touched: factories, unload
/// routines, predicates and custom methods all run unlocked, so any of them
/// may call back into the manager.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`ModuleManager`], for closures stored inside it.
#[derive(Clone)]
pub struct WeakModuleManager {
    inner: Weak<Inner>,
}

impl WeakModuleManager {
    pub fn upgrade(&self) -> Option<ModuleManager> {
        self.inner.upgrade().map(|inner| ModuleManager { inner })
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog: RwLock::new(BTreeMap::new()),
                methods: RwLock::new(HashMap::new()),
                state: Mutex::new(State::default()),
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakModuleManager {
        WeakModuleManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Scan the driver manifest.
    ///
    /// `resolve` maps a driver identifier to its class, or `None` when no such
    /// driver is compiled in. Unknown or failing entries are logged and
    /// skipped. Returns the number of descriptors added to the catalog.
    pub fn discover_modules<F>(&self, manifest: &[String], mut resolve: F) -> usize
    where
        F: FnMut(&str) -> Option<anyhow::Result<ModuleClass>>,
    {
        let mut found = 0;
        for id in manifest {
            match resolve(id) {
                None => {
                    tracing::warn!("Could not register module {}: no such driver", id);
                }
                Some(Err(e)) => {
                    tracing::warn!("Could not register module {}: {:#}", id, e);
                }
                Some(Ok(class)) => {
                    if self.register_class(class) {
                        found += 1;
                    }
                }
            }
        }
        found
    }

    /// Add a class to the catalog. Empty or duplicate names are rejected.
    pub fn register_class(&self, class: ModuleClass) -> bool {
        let name = class.descriptor.name.clone();
        if name.is_empty() {
            tracing::warn!("Refusing to register module with an empty name");
            return false;
        }

        let mut catalog = self.inner.catalog.write();
        if catalog.contains_key(&name) {
            tracing::warn!("Module \"{}\" is already registered, skipping", name);
            return false;
        }
        catalog.insert(name.clone(), Arc::new(class));
        tracing::info!("Discovered module \"{}\"", name);
        true
    }

    pub fn list_descriptors(&self) -> Vec<ModuleDescriptor> {
        self.inner
            .catalog
            .read()
            .values()
            .map(|class| class.descriptor.clone())
            .collect()
    }

    pub fn available_drivers(&self) -> Vec<String> {
        self.inner.catalog.read().keys().cloned().collect()
    }

    pub fn has_driver(&self, name: &str) -> bool {
        self.inner.catalog.read().contains_key(name)
    }

    /// Register a namespaced custom method, replacing any previous one
    pub fn install_custom_method<F>(&self, key: &str, method: F)
    where
        F: Fn(&Kwargs) -> ManagerResult<Value> + Send + Sync + 'static,
    {
        let previous = self
            .inner
            .methods
            .write()
            .insert(key.to_string(), Arc::new(method));
        if previous.is_some() {
            tracing::warn!("Custom method {} replaced", key);
        } else {
            tracing::debug!("Installed custom method {}", key);
        }
    }

    pub fn call_custom_method(&self, key: &str, kwargs: &Kwargs) -> ManagerResult<Value> {
        let method = self
            .inner
            .methods
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ManagerError::NotAvailable(key.to_string()))?;
        method(kwargs)
    }

    /// Declare a hook channel. Declaring an existing hook is a no-op.
    pub fn install_custom_hook(&self, name: &str) {
        if self.inner.state.lock().hooks.install(name) {
            tracing::debug!("Installed custom hook {}", name);
        }
    }

    pub fn attach_custom_hook<P>(&self, name: &str, predicate: P, action: HookAction) -> ManagerResult<()>
    where
        P: Fn(&Kwargs) -> bool + Send + Sync + 'static,
    {
        self.attach_handler(name, HookHandler::new(Arc::new(predicate), action, None))
    }

    fn attach_handler(&self, name: &str, handler: HookHandler) -> ManagerResult<()> {
        tracing::debug!("Attaching {:?} to hook {}", handler.action(), name);
        self.inner.state.lock().hooks.attach(name, handler)
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.inner.state.lock().hooks.contains(name)
    }

    /// Dispatch an event to every handler attached to `name`.
    ///
    /// The handler list is captured before the first predicate runs; changes
    /// made while dispatching apply from the next trigger on. A failing action
    /// is logged and does not stop the remaining handlers. Returns how many
    /// predicates matched.
    pub fn trigger_custom_hook(&self, name: &str, kwargs: &Kwargs) -> ManagerResult<usize> {
        let handlers = self.inner.state.lock().hooks.snapshot(name)?;

        let mut matched = 0;
        for handler in handlers.iter() {
            if !handler.matches(kwargs) {
                continue;
            }
            matched += 1;

            match handler.action() {
                HookAction::NoAction => {}
                HookAction::LoadModule(module) => {
                    if let Err(e) = self.load_module(module, kwargs.clone()) {
                        tracing::warn!("Hook {} failed to load {}: {}", name, module, e);
                    }
                }
                HookAction::UnloadModule(id) => {
                    if let Err(e) = self.unload_module(id) {
                        tracing::warn!("Hook {} failed to unload {}: {}", name, id, e);
                    }
                }
            }
        }

        Ok(matched)
    }

    /// Build a new instance of the named descriptor and return its id.
    pub fn load_module(&self, name: &str, kwargs: Kwargs) -> ManagerResult<String> {
        let class = self
            .inner
            .catalog
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::load(name, "invalid module name"))?;
        class.descriptor.check_arguments(&kwargs)?;

        let id = self.inner.state.lock().reserve(&class.descriptor)?;
        let handle = ModuleHandle {
            id: id.clone(),
            manager: self.downgrade(),
        };

        match class.instantiate(handle, &kwargs) {
            Ok(driver) => {
                let mut state = self.inner.state.lock();
                let serial = state.next_serial;
                state.next_serial += 1;
                let instance = LoadedModuleInstance {
                    id: id.clone(),
                    class,
                    args: kwargs,
                    serial,
                    driver: Mutex::new(Some(driver)),
                    retired: AtomicBool::new(false),
                };
                state.instances.insert(id.clone(), Slot::Ready(Arc::new(instance)));
                drop(state);

                if id == name {
                    tracing::info!("Loaded module \"{}\"", name);
                } else {
                    tracing::info!("Loaded module \"{}\" as \"{}\"", name, id);
                }
                Ok(id)
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                state.instances.remove(&id);
                state.hooks.detach_owner(&id);
                Err(e)
            }
        }
    }

    /// Run the instance's unload routine and remove it.
    ///
    /// The instance stops accepting calls immediately. When a property or
    /// method call is still running against it, the unload routine runs
    /// after that call returns instead of waiting for it here.
    pub fn unload_module(&self, id: &str) -> ManagerResult<()> {
        let instance = {
            let mut state = self.inner.state.lock();
            let instance = state.ready(id)?;
            state.instances.insert(id.to_string(), Slot::Unloading);
            state.hooks.detach_owner(id);
            instance
        };

        instance.retire();

        self.inner.state.lock().instances.remove(id);
        tracing::info!("Unloaded module \"{}\"", id);
        Ok(())
    }

    /// Unload every instance, newest first
    pub fn unload_all(&self) {
        let mut loaded: Vec<(u64, String)> = {
            let state = self.inner.state.lock();
            state
                .instances
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(instance) => Some((instance.serial, instance.id.clone())),
                    _ => None,
                })
                .collect()
        };
        loaded.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        for (_, id) in loaded {
            match self.unload_module(&id) {
                // already taken down by a cascading unload
                Ok(()) | Err(ManagerError::ModuleNotLoaded(_)) => {}
                Err(e) => tracing::error!("Failed to unload {}: {}", id, e),
            }
        }
    }

    pub fn loaded_instances(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut ids: Vec<String> = state
            .instances
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        matches!(self.inner.state.lock().instances.get(id), Some(Slot::Ready(_)))
    }

    fn instance(&self, id: &str) -> ManagerResult<Arc<LoadedModuleInstance>> {
        self.inner.state.lock().ready(id)
    }

    pub fn module_info(&self, id: &str) -> ManagerResult<Value> {
        let instance = self.instance(id)?;
        Ok(json!({
            "instance": instance.id,
            "descriptor": instance.descriptor(),
            "args": instance.args,
        }))
    }

    pub fn get_property_list(&self, id: &str) -> ManagerResult<Vec<PropertyDescriptor>> {
        Ok(self.instance(id)?.descriptor().properties.clone())
    }

    pub fn get_method_list(&self, id: &str) -> ManagerResult<Vec<MethodDescriptor>> {
        Ok(self.instance(id)?.descriptor().methods.clone())
    }

    pub fn get_property(&self, id: &str, property: &str) -> ManagerResult<Value> {
        let instance = self.instance(id)?;
        let desc = instance
            .descriptor()
            .find_property(property)
            .ok_or_else(|| ManagerError::NotAvailable(format!("{}.{}", id, property)))?;
        if !desc.permissions.can_read() {
            return Err(ManagerError::PropertyPermission {
                property: property.to_string(),
                access: "read",
            });
        }
        instance.with_driver(|driver| driver.get_property(property))
    }

    pub fn set_property(&self, id: &str, property: &str, value: Value) -> ManagerResult<()> {
        let instance = self.instance(id)?;
        let desc = instance
            .descriptor()
            .find_property(property)
            .ok_or_else(|| ManagerError::NotAvailable(format!("{}.{}", id, property)))?;
        if !desc.permissions.can_write() {
            return Err(ManagerError::PropertyPermission {
                property: property.to_string(),
                access: "write",
            });
        }
        instance.with_driver(|driver| driver.set_property(property, value))
    }

    pub fn call_method(&self, id: &str, method: &str, args: &Kwargs) -> ManagerResult<Value> {
        let instance = self.instance(id)?;
        instance
            .descriptor()
            .find_method(method)
            .ok_or_else(|| ManagerError::NotAvailable(format!("{}.{}", id, method)))?
            .check_arguments(args)?;
        instance.with_driver(|driver| driver.call_method(method, args))
    }

    /// Device-id registry scoped to one driver type, shared by all its instances
    pub fn device_registry(&self, scope: &str) -> DeviceRegistry {
        self.inner
            .devices
            .lock()
            .entry(scope.to_string())
            .or_default()
            .clone()
    }
}

/// Set of device ids claimed by the instances of one driver type.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    /// Claim `id`; false if another instance already holds it
    pub fn claim(&self, id: &str) -> bool {
        self.ids.lock().insert(id.to_string())
    }

    pub fn release(&self, id: &str) -> bool {
        self.ids.lock().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }
}

/// Handed to every driver at construction: its id and a way back into the
/// manager.
#[derive(Clone)]
pub struct ModuleHandle {
    id: String,
    manager: WeakModuleManager,
}

impl ModuleHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn manager(&self) -> ManagerResult<ModuleManager> {
        self.manager
            .upgrade()
            .ok_or_else(|| ManagerError::ModuleNotLoaded(self.id.clone()))
    }

    pub fn log_info(&self, message: impl Display) {
        tracing::info!("{}: {}", self.id, message);
    }

    pub fn log_warning(&self, message: impl Display) {
        tracing::warn!("{}: {}", self.id, message);
    }

    pub fn log_error(&self, message: impl Display) {
        tracing::error!("{}: {}", self.id, message);
    }

    pub fn call_custom_method(&self, key: &str, kwargs: &Kwargs) -> ManagerResult<Value> {
        self.manager()?.call_custom_method(key, kwargs)
    }

    /// Attach a handler owned by this instance; it is detached on unload
    pub fn attach_custom_hook<P>(&self, name: &str, predicate: P, action: HookAction) -> ManagerResult<()>
    where
        P: Fn(&Kwargs) -> bool + Send + Sync + 'static,
    {
        self.manager()?.attach_handler(
            name,
            HookHandler::new(Arc::new(predicate), action, Some(self.id.clone())),
        )
    }

    pub fn trigger_custom_hook(&self, name: &str, kwargs: &Kwargs) -> ManagerResult<usize> {
        self.manager()?.trigger_custom_hook(name, kwargs)
    }

    pub fn load_module(&self, name: &str, kwargs: Kwargs) -> ManagerResult<String> {
        self.manager()?.load_module(name, kwargs)
    }

    pub fn unload_module(&self, id: &str) -> ManagerResult<()> {
        self.manager()?.unload_module(id)
    }

    pub fn available_drivers(&self) -> ManagerResult<Vec<String>> {
        Ok(self.manager()?.available_drivers())
    }

    pub fn module_info(&self, id: &str) -> ManagerResult<Value> {
        self.manager()?.module_info(id)
    }

    /// Call a method on another instance
    pub fn call_method(&self, id: &str, method: &str, args: &Kwargs) -> ManagerResult<Value> {
        if id == self.id {
            return Err(ManagerError::InvalidArguments(format!(
                "{} cannot call itself through the manager",
                id
            )));
        }
        self.manager()?.call_method(id, method, args)
    }

    pub fn device_registry(&self, scope: &str) -> ManagerResult<DeviceRegistry> {
        Ok(self.manager()?.device_registry(scope))
    }
}
