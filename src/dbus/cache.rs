//! An ordered, batched cache of remote object properties.
//!
//! The cache mirrors `path → interface → property → value` for whatever the
//! match rules cover, preferring ObjectManager where available and falling
//! back to recursive introspection. The hard part is ordering: consumers
//! must see an interface's schema (`meta`) before any of its properties,
//! updates must arrive grouped and in the order they were caused, and a
//! barrier installed after some operations must fire only once those
//! operations' updates have been delivered.
//!
//! Ordering is kept with batches: reference-counted tokens carrying a
//! monotonically assigned number. Every asynchronous call that contributes
//! to a logical update holds a reference on its batch; when the count drops
//! to zero the accumulated changes go out as one `update`, and barriers
//! whose recorded number has completed may fire.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::LocalBoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::json;
use crate::paths::{self, PathSet};
use crate::rules::MatchRules;

use super::connection::{is_object_path, CallError, DbusClient, InterfaceInfo, NodeInfo};
use super::intern::Interner;

/// Properties of one interface at one path.
pub type PropMap = HashMap<Arc<str>, Value>;

/// One batched update: path to interface to properties. An interface of
/// `None` was removed at that path.
pub type UpdateMap = HashMap<Arc<str>, HashMap<Arc<str>, Option<PropMap>>>;

/// Callback invoked the first time an interface's schema becomes visible.
pub type MetaHandler = Box<dyn FnMut(&InterfaceInfo)>;

/// Callback invoked with each completed batch of changes.
pub type UpdateHandler = Box<dyn FnMut(&UpdateMap)>;

struct BatchState {
    number: u64,
    refs: usize,
}

enum BarrierAction {
    User(Box<dyn FnOnce()>),
    PropertiesChanged {
        path: Arc<str>,
        interface: String,
        changed: Map<String, Value>,
        invalidated: Vec<String>,
    },
    InterfacesAdded {
        path: Arc<str>,
        interfaces: Map<String, Value>,
        manager_added: Option<Arc<str>>,
    },
    InterfacesRemoved {
        path: Arc<str>,
        interfaces: Vec<String>,
        manager_added: Option<Arc<str>>,
    },
}

struct Barrier {
    number: u64,
    action: BarrierAction,
}

/// What to do with the interface schema once an introspect resolves.
enum IntrospectAction {
    None,
    Poke {
        path: Arc<str>,
        batch: u64,
    },
    Interface {
        path: Arc<str>,
        dict: Map<String, Value>,
        batch: u64,
    },
    PropertiesChanged {
        path: Arc<str>,
        changed: Map<String, Value>,
        invalidated: Vec<String>,
        batch: u64,
    },
}

struct IntrospectData {
    path: Arc<str>,
    interface: Option<Arc<str>>,
    batch: u64,
    action: IntrospectAction,
}

enum CallReply {
    GetAll {
        batch: u64,
        path: Arc<str>,
        iface: Rc<InterfaceInfo>,
        result: Result<Map<String, Value>, CallError>,
    },
    Get {
        batch: u64,
        path: Arc<str>,
        iface: Rc<InterfaceInfo>,
        property: Arc<str>,
        result: Result<Value, CallError>,
    },
    ManagedObjects {
        batch: u64,
        path: Arc<str>,
        result: Result<Map<String, Value>, CallError>,
    },
}

/// The property cache. See the module docs for the ordering contract.
pub struct DbusCache {
    client: Rc<dyn DbusClient>,
    logname: String,
    cancel: CancellationToken,

    cache: HashMap<Arc<str>, HashMap<Arc<str>, PropMap>>,
    introspected: HashMap<Arc<str>, Rc<InterfaceInfo>>,
    introsent: HashSet<Arc<str>>,
    managed: PathSet,
    rules: MatchRules,
    interner: Interner,

    batches: VecDeque<BatchState>,
    next_number: u64,
    barriers: VecDeque<Barrier>,
    update: Option<UpdateMap>,

    introspects: VecDeque<IntrospectData>,
    current_introspect: Option<(
        IntrospectData,
        LocalBoxFuture<'static, Result<NodeInfo, CallError>>,
    )>,

    calls: FuturesUnordered<LocalBoxFuture<'static, CallReply>>,

    on_meta: MetaHandler,
    on_update: UpdateHandler,
}

impl DbusCache {
    /// Creates a cache over `client`. `on_meta` and `on_update` receive the
    /// two notification streams, in the guaranteed order.
    pub fn new(
        client: Rc<dyn DbusClient>,
        logname: &str,
        on_meta: MetaHandler,
        on_update: UpdateHandler,
    ) -> DbusCache {
        DbusCache {
            client,
            logname: logname.to_owned(),
            cancel: CancellationToken::new(),
            cache: HashMap::new(),
            introspected: HashMap::new(),
            introsent: HashSet::new(),
            managed: PathSet::new(),
            rules: MatchRules::new(),
            interner: Interner::new(),
            batches: VecDeque::new(),
            next_number: 1,
            barriers: VecDeque::new(),
            update: None,
            introspects: VecDeque::new(),
            current_introspect: None,
            calls: FuturesUnordered::new(),
            on_meta,
            on_update,
        }
    }

    /// The current value of a cached property, for consumers that want to
    /// look rather than listen.
    pub fn value(&self, path: &str, interface: &str, property: &str) -> Option<&Value> {
        self.cache.get(path)?.get(interface)?.get(property)
    }

    /// The interfaces cached at a path.
    pub fn interfaces_at(&self, path: &str) -> Option<Vec<&str>> {
        Some(
            self.cache
                .get(path)?
                .keys()
                .map(|name| &**name)
                .collect(),
        )
    }

    /// Whether any work is still outstanding.
    pub fn is_idle(&self) -> bool {
        self.batches.is_empty()
            && self.current_introspect.is_none()
            && self.introspects.is_empty()
            && self.calls.is_empty()
    }

    // ===== batches and barriers =====

    fn batch_create(&mut self) -> u64 {
        self.next_number += 1;
        let number = self.next_number;
        self.batches.push_back(BatchState { number, refs: 1 });
        number
    }

    fn batch_ref(&mut self, number: u64) {
        if let Some(batch) = self
            .batches
            .iter_mut()
            .find(|batch| batch.number == number)
        {
            batch.refs += 1;
        }
    }

    fn batch_unref(&mut self, number: u64) {
        if let Some(batch) = self
            .batches
            .iter_mut()
            .find(|batch| batch.number == number)
        {
            debug_assert!(batch.refs > 0);
            batch.refs -= 1;
        }
        self.batch_progress();
    }

    fn batch_progress(&mut self) {
        loop {
            match self.batches.front() {
                Some(batch) if batch.refs == 0 => {
                    self.batches.pop_front();
                }
                _ => return,
            }

            if let Some(update) = self.update.take() {
                (self.on_update)(&update);
            }

            self.barrier_progress();
        }
    }

    fn barrier_progress(&mut self) {
        loop {
            let blocked = match (self.barriers.front(), self.batches.front()) {
                (None, _) => return,
                // Block barriers that recorded this or a later batch.
                (Some(barrier), Some(batch)) => batch.number <= barrier.number,
                (Some(_), None) => false,
            };
            if blocked {
                return;
            }

            let barrier = self.barriers.pop_front().expect("barrier present");
            self.barrier_fire(barrier.action);
        }
    }

    /// Schedules `callback` to run after every currently outstanding batch
    /// has completed and delivered its update. Runs immediately when
    /// nothing is outstanding.
    pub fn barrier<F>(&mut self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.install_barrier(BarrierAction::User(Box::new(callback)));
    }

    fn install_barrier(&mut self, action: BarrierAction) {
        match self.batches.back() {
            Some(batch) => {
                let number = batch.number;
                self.barriers.push_back(Barrier { number, action });
            }
            None => self.barrier_fire(action),
        }
    }

    fn barrier_fire(&mut self, action: BarrierAction) {
        match action {
            BarrierAction::User(callback) => callback(),
            BarrierAction::PropertiesChanged {
                path,
                interface,
                changed,
                invalidated,
            } => {
                let batch = self.batch_create();
                let interface = self.interner.intern(&interface);
                self.batch_ref(batch);
                let action = IntrospectAction::PropertiesChanged {
                    path: path.clone(),
                    changed: changed.clone(),
                    invalidated,
                    batch,
                };
                self.introspect_maybe(Some(batch), path, interface, action);
                self.scrape_map(Some(batch), &changed);
                self.batch_unref(batch);
            }
            BarrierAction::InterfacesAdded {
                path,
                interfaces,
                manager_added,
            } => {
                // A manager appearing is loaded in full, in the same batch
                // as the interfaces that announced it.
                let batch = match manager_added {
                    Some(manager) => {
                        let batch = self.batch_create();
                        self.retrieve_managed_objects(batch, manager);
                        Some(batch)
                    }
                    None => None,
                };
                self.process_interfaces(batch, None, &path, &interfaces);
                if let Some(batch) = batch {
                    self.batch_unref(batch);
                }
            }
            BarrierAction::InterfacesRemoved {
                path,
                interfaces,
                manager_added,
            } => {
                let batch = self.batch_create();
                if let Some(manager) = manager_added {
                    self.retrieve_managed_objects(batch, manager);
                }
                for interface in interfaces {
                    let interface = self.interner.intern(&interface);
                    self.process_removed(&path, &interface);
                }
                self.batch_unref(batch);
            }
        }
    }

    // ===== update accumulation =====

    fn emit_remove(&mut self, path: &Arc<str>, interface: &Arc<str>) {
        let update = self.update.get_or_insert_with(HashMap::new);
        update
            .entry(path.clone())
            .or_insert_with(HashMap::new)
            .insert(interface.clone(), None);
    }

    fn emit_change(
        &mut self,
        path: &Arc<str>,
        interface: &Arc<str>,
        change: Option<(Arc<str>, Value)>,
    ) {
        let update = self.update.get_or_insert_with(HashMap::new);
        let slot = update
            .entry(path.clone())
            .or_insert_with(HashMap::new)
            .entry(interface.clone())
            .or_insert_with(|| Some(PropMap::new()));
        if slot.is_none() {
            *slot = Some(PropMap::new());
        }
        if let Some((property, value)) = change {
            slot.as_mut().expect("slot was just ensured").insert(property, value);
        }
    }

    // ===== cache bookkeeping =====

    fn ensure_interfaces(&mut self, path: &Arc<str>) {
        self.cache.entry(path.clone()).or_insert_with(HashMap::new);
    }

    /// Ensures the property table for an interface at a path, emitting the
    /// `meta` notification the first time the interface surfaces.
    fn ensure_properties(&mut self, path: &Arc<str>, iface: &Rc<InterfaceInfo>) {
        let name = self.interner.intern(&iface.name);

        let interfaces = self.cache.entry(path.clone()).or_insert_with(HashMap::new);
        if !interfaces.contains_key(&name) {
            interfaces.insert(name.clone(), PropMap::new());
            debug!("{}: present {} at {}", self.logname, iface.name, path);
            self.emit_change(path, &name, None);
        }

        if !self.introsent.contains(&name) {
            self.introsent.insert(name.clone());
            (self.on_meta)(iface);
        }
    }

    fn process_value(
        &mut self,
        path: &Arc<str>,
        iface: &Rc<InterfaceInfo>,
        property: &str,
        value: Value,
    ) {
        let name = self.interner.intern(&iface.name);
        let property = self.interner.intern(property);

        let properties = self
            .cache
            .get_mut(path)
            .and_then(|interfaces| interfaces.get_mut(&name));
        let properties = match properties {
            Some(properties) => properties,
            None => return,
        };

        if let Some(prev) = properties.get(&property) {
            if json::equal(Some(prev), Some(&value)) {
                return;
            }
        }
        properties.insert(property.clone(), value.clone());

        trace!(
            "{}: changed {} {} at {}",
            self.logname,
            iface.name,
            property,
            path
        );
        self.emit_change(path, &name, Some((property, value)));
    }

    fn process_properties(
        &mut self,
        path: &Arc<str>,
        iface: &Rc<InterfaceInfo>,
        dict: &Map<String, Value>,
    ) {
        self.ensure_properties(path, iface);
        for (property, value) in dict {
            self.process_value(path, iface, property, value.clone());
        }
    }

    fn process_removed(&mut self, path: &Arc<str>, interface: &Arc<str>) {
        let removed = self
            .cache
            .get_mut(path)
            .map_or(false, |interfaces| interfaces.remove(interface).is_some());
        if removed {
            debug!("{}: removed {} at {}", self.logname, interface, path);
            self.emit_remove(path, interface);
        }
    }

    fn process_removed_path(&mut self, path: &Arc<str>) {
        let interfaces: Vec<Arc<str>> = match self.cache.get(path) {
            Some(interfaces) => interfaces.keys().cloned().collect(),
            None => return,
        };
        for interface in interfaces {
            self.process_removed(path, &interface);
        }
    }

    // ===== introspection =====

    fn register_interface(&mut self, iface: &InterfaceInfo) -> Rc<InterfaceInfo> {
        let name = self.interner.intern(&iface.name);
        if let Some(existing) = self.introspected.get(&name) {
            return existing.clone();
        }
        let registered = Rc::new(iface.clone());
        self.introspected.insert(name, registered.clone());
        registered
    }

    fn introspect_push(
        &mut self,
        batch: u64,
        path: Arc<str>,
        interface: Option<Arc<str>>,
        action: IntrospectAction,
    ) {
        self.batch_ref(batch);
        debug!(
            "{}: queueing introspect {}{}{}",
            self.logname,
            path,
            if interface.is_some() { " for " } else { "" },
            interface.as_deref().unwrap_or("")
        );
        self.introspects.push_back(IntrospectData {
            path,
            interface,
            batch,
            action,
        });
        self.introspect_next();
    }

    fn introspect_next(&mut self) {
        if self.current_introspect.is_some() {
            return;
        }
        let id = match self.introspects.pop_front() {
            Some(id) => id,
            None => return,
        };

        if self.cancel.is_cancelled() {
            self.introspect_complete(id);
            // More entries may be waiting; completing one can queue more.
            return self.introspect_next();
        }

        debug!("{}: calling Introspect() on {}", self.logname, id.path);
        let future = self.client.introspect(&id.path);
        self.current_introspect = Some((id, future));
    }

    fn introspect_complete(&mut self, id: IntrospectData) {
        let iface = match id.interface {
            Some(ref interface) => {
                let iface = match self.introspected.get(interface) {
                    Some(iface) => iface.clone(),
                    None => {
                        debug!(
                            "{}: introspect interface {} didn't work",
                            self.logname, interface
                        );

                        // The expected interface was not at the expected
                        // object. Register a pretend empty interface so the
                        // ordering guarantees hold regardless.
                        let empty = InterfaceInfo::named(interface);
                        self.register_interface(&empty)
                    }
                };
                Some(iface)
            }
            None => None,
        };

        self.run_action(id.action, iface);
        self.batch_unref(id.batch);
    }

    fn run_action(&mut self, action: IntrospectAction, iface: Option<Rc<InterfaceInfo>>) {
        match action {
            IntrospectAction::None => (),
            IntrospectAction::Poke { path, batch } => {
                if let Some(iface) = iface {
                    self.retrieve_properties(batch, path, iface);
                }
                self.batch_unref(batch);
            }
            IntrospectAction::Interface { path, dict, batch } => {
                if let Some(iface) = iface {
                    self.process_properties(&path, &iface, &dict);
                }
                self.batch_unref(batch);
            }
            IntrospectAction::PropertiesChanged {
                path,
                changed,
                invalidated,
                batch,
            } => {
                if let Some(iface) = iface {
                    self.process_properties(&path, &iface, &changed);

                    // Invalidated properties are ones the service did not
                    // want to broadcast. We want them anyway, in the same
                    // batch.
                    for property in invalidated {
                        let property = self.interner.intern(&property);
                        debug!(
                            "{}: calling Get() for {} {} at {}",
                            self.logname, iface.name, property, path
                        );
                        self.batch_ref(batch);
                        let future =
                            self.client.get(&path, &iface.name, &property);
                        let (path, iface) = (path.clone(), iface.clone());
                        self.calls.push(Box::pin(async move {
                            CallReply::Get {
                                batch,
                                path,
                                iface,
                                property,
                                result: future.await,
                            }
                        }));
                    }
                }
                self.batch_unref(batch);
            }
        }
    }

    /// Runs `action` now when the interface schema is already known,
    /// introspecting first otherwise.
    fn introspect_maybe(
        &mut self,
        batch: Option<u64>,
        path: Arc<str>,
        interface: Arc<str>,
        action: IntrospectAction,
    ) {
        if let Some(iface) = self.introspected.get(&interface).cloned() {
            self.run_action(action, Some(iface));
            return;
        }

        let batch = match batch {
            Some(batch) => {
                self.batch_ref(batch);
                batch
            }
            None => self.batch_create(),
        };
        self.introspect_push(batch, path, Some(interface), action);
        self.batch_unref(batch);
    }

    fn process_introspect_node(
        &mut self,
        batch: u64,
        path: &Arc<str>,
        node: &NodeInfo,
        recursive: bool,
    ) {
        // Anything under an ObjectManager is that manager's business.
        let recursive = recursive && self.managed.contains_or_ancestor(path).is_none();

        let mut snapshot: HashSet<Arc<str>> = self
            .cache
            .get(path)
            .map(|interfaces| interfaces.keys().cloned().collect())
            .unwrap_or_default();

        let mut manager_found = false;
        for iface in &node.interfaces {
            if iface.name.is_empty() {
                warn!(
                    "received interface from {} at {} without name",
                    self.logname, path
                );
                continue;
            }

            let registered = self.register_interface(iface);

            // The well-known interfaces have no interesting properties, but
            // their presence still means the path exists.
            if iface.name.starts_with("org.freedesktop.DBus.") {
                // A node reporting ObjectManager switches this subtree over
                // to managed loading, in the same batch.
                if iface.name == "org.freedesktop.DBus.ObjectManager" {
                    manager_found = true;
                    if self.managed.add(path).is_some() {
                        self.retrieve_managed_objects(batch, path.clone());
                    }
                }
                self.ensure_interfaces(path);
                continue;
            }

            let name = self.interner.intern(&iface.name);
            snapshot.remove(&name);

            if recursive && self.rules.matches(path, Some(&iface.name), None, None) {
                self.retrieve_properties(batch, path.clone(), registered);
            }
        }

        for interface in snapshot {
            self.process_removed(path, &interface);
        }

        // A manager enumerates its own children; walking them here as well
        // would fetch everything twice.
        if recursive && !manager_found {
            self.process_introspect_children(batch, path, node);
        }
    }

    fn process_introspect_children(&mut self, batch: u64, parent_path: &Arc<str>, node: &NodeInfo) {
        let mut snapshot: HashSet<Arc<str>> = self
            .cache
            .keys()
            .filter(|path| paths::has_parent(path, parent_path))
            .cloned()
            .collect();

        for child in &node.nodes {
            let name = match child.path {
                Some(ref name) => name,
                None => continue,
            };

            let child_path = if name.starts_with('/') {
                name.clone()
            } else if &**parent_path == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", parent_path, name)
            };

            let child_path = self.interner.intern(&child_path);
            snapshot.remove(&child_path);

            if self.rules.matches(&child_path, None, None, None)
                && self.managed.contains_or_ancestor(&child_path).is_none()
            {
                if !child.interfaces.is_empty() {
                    // Inline child interfaces are rare but possible.
                    self.process_introspect_node(batch, &child_path, child, true);
                } else {
                    self.introspect_push(batch, child_path, None, IntrospectAction::None);
                }
            }
        }

        for path in snapshot {
            self.process_removed_path(&path);
        }
    }

    // ===== remote calls =====

    fn retrieve_properties(&mut self, batch: u64, path: Arc<str>, iface: Rc<InterfaceInfo>) {
        // This well known interface has no properties of its own, and some
        // services return an error when asked.
        if iface.name == "org.freedesktop.DBus.Properties" {
            return;
        }

        debug!(
            "{}: calling GetAll() for {} at {}",
            self.logname, iface.name, path
        );

        self.batch_ref(batch);
        let future = self.client.get_all(&path, &iface.name);
        self.calls.push(Box::pin(async move {
            CallReply::GetAll {
                batch,
                path,
                iface,
                result: future.await,
            }
        }));
    }

    fn retrieve_managed_objects(&mut self, batch: u64, namespace_path: Arc<str>) {
        debug!(
            "{}: calling GetManagedObjects() on {}",
            self.logname, namespace_path
        );

        self.batch_ref(batch);
        let future = self.client.get_managed_objects(&namespace_path);
        self.calls.push(Box::pin(async move {
            CallReply::ManagedObjects {
                batch,
                path: namespace_path,
                result: future.await,
            }
        }));
    }

    fn handle_reply(&mut self, reply: CallReply) {
        match reply {
            CallReply::GetAll {
                batch,
                path,
                iface,
                result,
            } => {
                match result {
                    Ok(dict) => {
                        trace!(
                            "{}: reply to GetAll() for {} at {}",
                            self.logname,
                            iface.name,
                            path
                        );
                        self.process_properties(&path, &iface, &dict);
                        self.scrape_map(Some(batch), &dict);
                    }
                    Err(error) => self.complain(&error, "couldn't get all properties"),
                }

                // Whether or not this worked, the interface exists there.
                self.ensure_properties(&path, &iface);
                let name = self.interner.intern(&iface.name);
                self.emit_change(&path, &name, None);

                self.batch_unref(batch);
            }
            CallReply::Get {
                batch,
                path,
                iface,
                property,
                result,
            } => {
                match result {
                    Ok(value) => {
                        trace!("{}: reply from Get() on {}", self.logname, path);
                        self.ensure_properties(&path, &iface);
                        self.process_value(&path, &iface, &property, value.clone());
                        self.scrape(&value);
                    }
                    Err(error) => self.complain(&error, "couldn't get property"),
                }
                self.batch_unref(batch);
            }
            CallReply::ManagedObjects {
                batch,
                path,
                result,
            } => {
                match result {
                    Ok(objects) => {
                        trace!(
                            "{}: reply from GetManagedObjects() on {}",
                            self.logname,
                            path
                        );
                        self.managed.add(&path);
                        self.process_get_managed_objects(batch, &path, &objects);
                    }
                    Err(error) => {
                        if error.is_expected() {
                            debug!("{}: no ObjectManager at {}", self.logname, path);
                        } else if !self.cancel.is_cancelled() {
                            warn!(
                                "{}: couldn't get managed objects at {}: {}",
                                self.logname, path, error
                            );
                        }
                    }
                }

                // The manager path itself is not part of its own report, so
                // it still needs introspecting. Queued after the children so
                // they are treated as managed.
                self.introspect_push(batch, path, None, IntrospectAction::None);

                self.batch_unref(batch);
            }
        }
    }

    fn complain(&self, error: &CallError, what: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        if error.is_expected() {
            debug!("{}: {}: {}", self.logname, what, error);
        } else {
            warn!("{}: {}: {}", self.logname, what, error);
        }
    }

    fn process_interfaces(
        &mut self,
        batch: Option<u64>,
        mut snapshot: Option<&mut HashSet<Arc<str>>>,
        path: &Arc<str>,
        dict: &Map<String, Value>,
    ) {
        let mut local = match batch {
            Some(batch) => {
                self.batch_ref(batch);
                Some(batch)
            }
            None => None,
        };

        for (interface, inner) in dict {
            let inner = match inner {
                Value::Object(inner) => inner,
                _ => continue,
            };
            if !self.rules.matches(path, Some(interface), None, None) {
                continue;
            }

            let batch = match local {
                Some(batch) => batch,
                None => {
                    let batch = self.batch_create();
                    local = Some(batch);
                    batch
                }
            };

            if let Some(ref mut snapshot) = snapshot {
                let name = self.interner.intern(interface);
                snapshot.remove(&name);
            }

            // The action holds its own reference until it has run.
            self.batch_ref(batch);
            let interface = self.interner.intern(interface);
            let action = IntrospectAction::Interface {
                path: path.clone(),
                dict: inner.clone(),
                batch,
            };
            self.introspect_maybe(Some(batch), path.clone(), interface, action);
            self.scrape_map(Some(batch), inner);
        }

        if let Some(batch) = local {
            self.batch_unref(batch);
        }
    }

    fn process_get_managed_objects(
        &mut self,
        batch: u64,
        manager_path: &Arc<str>,
        objects: &Map<String, Value>,
    ) {
        // The report is authoritative for the whole subtree: interfaces and
        // paths it does not mention are gone.
        let mut snapshot: HashSet<Arc<str>> = self
            .cache
            .keys()
            .filter(|path| paths::has_ancestor(path, manager_path))
            .cloned()
            .collect();

        for (path, inner) in objects {
            let inner = match inner {
                Value::Object(inner) => inner,
                _ => continue,
            };
            let path = self.interner.intern(path);
            snapshot.remove(&path);

            let mut snap: HashSet<Arc<str>> = self
                .cache
                .get(&path)
                .map(|interfaces| interfaces.keys().cloned().collect())
                .unwrap_or_default();

            self.process_interfaces(Some(batch), Some(&mut snap), &path, inner);

            for interface in snap {
                self.process_removed(&path, &interface);
            }
        }

        for path in snapshot {
            self.process_removed_path(&path);
        }
    }

    // ===== public operations =====

    /// Starts watching a path (or namespace), optionally narrowed to one
    /// interface, and loads the covered part of the tree.
    pub fn watch(&mut self, path: Option<&str>, is_namespace: bool, interface: Option<&str>) {
        if !self.rules.add(path, is_namespace, interface, None, None) {
            return;
        }

        let (path, is_namespace) = match path {
            Some(path) => (path, is_namespace),
            None => ("/", true),
        };

        let batch = self.batch_create();
        let path = self.interner.intern(path);

        let namespace_path = if is_namespace {
            Some(path.clone())
        } else {
            self.managed.contains_or_ancestor(&path)
        };

        match namespace_path {
            Some(namespace_path) => self.retrieve_managed_objects(batch, namespace_path),
            None => self.introspect_push(batch, path, None, IntrospectAction::None),
        }

        self.batch_unref(batch);
    }

    /// Drops one reference to a watch. Nothing is evicted immediately.
    pub fn unwatch(
        &mut self,
        path: Option<&str>,
        is_namespace: bool,
        interface: Option<&str>,
    ) -> bool {
        self.rules.remove(path, is_namespace, interface, None, None)
    }

    /// Forces a fetch of a path (or path and interface), as if it had just
    /// been announced. Does nothing when already cached or not covered.
    pub fn poke(&mut self, path: &str, interface: Option<&str>) {
        if let Some(interfaces) = self.cache.get(path) {
            match interface {
                None => return,
                Some(interface) if interfaces.contains_key(interface) => return,
                Some(_) => (),
            }
        }

        if self.managed.contains_or_ancestor(path).is_some() {
            return;
        }

        if !self.rules.matches(path, interface, None, None) {
            return;
        }

        let batch = self.batch_create();
        let path = self.interner.intern(path);

        match interface {
            Some(interface) => {
                // With the interface known we may have its schema already
                // and can skip introspecting the whole path.
                let interface = self.interner.intern(interface);
                self.batch_ref(batch);
                let action = IntrospectAction::Poke {
                    path: path.clone(),
                    batch,
                };
                self.introspect_maybe(Some(batch), path, interface, action);
            }
            None => {
                self.introspect_push(batch, path, None, IntrospectAction::None);
            }
        }

        self.batch_unref(batch);
    }

    /// Deep-walks a value and introspects any object path mentioned that is
    /// not yet covered. Replies that refer to other objects pull them in.
    pub fn scrape(&mut self, value: &Value) {
        self.scrape_value(None, value);
    }

    fn scrape_map(&mut self, batch: Option<u64>, dict: &Map<String, Value>) {
        let mut found = HashSet::new();
        for value in dict.values() {
            collect_paths(value, &mut found);
        }
        self.scrape_found(batch, found);
    }

    fn scrape_value(&mut self, batch: Option<u64>, value: &Value) {
        let mut found = HashSet::new();
        collect_paths(value, &mut found);
        self.scrape_found(batch, found);
    }

    fn scrape_found(&mut self, batch: Option<u64>, found: HashSet<String>) {
        let mut local = batch;
        let mut created = false;

        for path in found {
            if path == "/" {
                continue;
            }
            if self.cache.contains_key(path.as_str()) {
                continue;
            }
            if self.managed.contains_or_ancestor(&path).is_some() {
                continue;
            }
            if !self.rules.matches(&path, None, None, None) {
                continue;
            }

            let batch = match local {
                Some(batch) => batch,
                None => {
                    let batch = self.batch_create();
                    created = true;
                    local = Some(batch);
                    batch
                }
            };

            let path = self.interner.intern(&path);
            self.introspect_push(batch, path, None, IntrospectAction::None);
        }

        if created {
            self.batch_unref(local.expect("batch was created"));
        }
    }

    // ===== signals =====

    /// Feeds a `PropertiesChanged` signal observed at `path`.
    pub fn properties_changed(
        &mut self,
        path: &str,
        interface: &str,
        changed: Map<String, Value>,
        invalidated: Vec<String>,
    ) {
        debug!("{}: signal PropertiesChanged at {}", self.logname, path);

        if !self.rules.matches(path, Some(interface), None, None) {
            return;
        }

        let path = self.interner.intern(path);
        self.install_barrier(BarrierAction::PropertiesChanged {
            path,
            interface: interface.to_owned(),
            changed,
            invalidated,
        });
    }

    /// Feeds an `InterfacesAdded` signal emitted by the manager at
    /// `manager_path` about `path`.
    pub fn interfaces_added(
        &mut self,
        manager_path: &str,
        path: &str,
        interfaces: Map<String, Value>,
    ) {
        debug!("{}: signal InterfacesAdded at {}", self.logname, manager_path);

        // The signal itself proves there is an ObjectManager here.
        let manager_added = self.managed.add(manager_path);
        let path = self.interner.intern(path);
        self.install_barrier(BarrierAction::InterfacesAdded {
            path,
            interfaces,
            manager_added,
        });
    }

    /// Feeds an `InterfacesRemoved` signal emitted by the manager at
    /// `manager_path` about `path`.
    pub fn interfaces_removed(
        &mut self,
        manager_path: &str,
        path: &str,
        interfaces: Vec<String>,
    ) {
        debug!(
            "{}: signal InterfacesRemoved at {}",
            self.logname, manager_path
        );

        let manager_added = self.managed.add(manager_path);
        let path = self.interner.intern(path);
        self.install_barrier(BarrierAction::InterfacesRemoved {
            path,
            interfaces,
            manager_added,
        });
    }

    // ===== driving =====

    /// Drives outstanding introspection and property calls. Notifications
    /// fire from inside this call, in order.
    pub fn poll(&mut self, cx: &mut Context<'_>) {
        if self.cancel.is_cancelled() {
            return;
        }

        loop {
            if self.current_introspect.is_none() {
                self.introspect_next();
            }

            let (id, mut future) = match self.current_introspect.take() {
                Some(current) => current,
                None => break,
            };

            match future.as_mut().poll(cx) {
                Poll::Pending => {
                    self.current_introspect = Some((id, future));
                    break;
                }
                Poll::Ready(Ok(node)) => {
                    trace!("{}: reply from Introspect() at {}", self.logname, id.path);
                    let recursive = id.interface.is_none();
                    let path = id.path.clone();
                    self.process_introspect_node(id.batch, &path, &node, recursive);
                    self.introspect_complete(id);
                }
                Poll::Ready(Err(error)) => {
                    if !error.is_expected() && !self.cancel.is_cancelled() {
                        warn!(
                            "{}: couldn't introspect {}: {}",
                            self.logname, id.path, error
                        );
                    }
                    self.introspect_complete(id);
                }
            }
        }

        while let Poll::Ready(Some(reply)) = self.calls.poll_next_unpin(cx) {
            self.handle_reply(reply);
        }
    }

    /// Tears the cache down: cancels outstanding calls and drains batch and
    /// barrier queues without emitting further updates. Pending user
    /// barriers still run.
    pub fn dispose(&mut self) {
        self.cancel.cancel();

        self.calls = FuturesUnordered::new();
        self.current_introspect = None;
        self.introspects.clear();
        self.batches.clear();
        self.update = None;

        let barriers = std::mem::take(&mut self.barriers);
        for barrier in barriers {
            if let BarrierAction::User(callback) = barrier.action {
                callback();
            }
        }
    }
}

impl Drop for DbusCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for DbusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbusCache")
            .field("logname", &self.logname)
            .field("paths", &self.cache.len())
            .field("batches", &self.batches.len())
            .finish()
    }
}

fn collect_paths(value: &Value, found: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            if is_object_path(s) {
                found.insert(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_paths(item, found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if is_object_path(key) {
                    found.insert(key.clone());
                }
                collect_paths(item, found);
            }
        }
        _ => (),
    }
}
