//! In-process [`Keeper`] used by tests and single-process setups.

use crate::{
    CreateMode, Error, Keeper, KeeperConnector, Op, OpResult, Result, Stat, Watch, WatchEvent,
    WatchKind, parent_path,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shared in-memory tree. Sessions are obtained via [`KeeperConnector::connect`]
/// and can be force-expired with [`MemKeeper::expire_session`] to exercise
/// recovery code. Clones share the same tree.
#[derive(Debug, Clone)]
pub struct MemKeeper {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    state: Mutex<State>,
    next_session_id: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, CancellationToken>,
    node_watches: HashMap<String, Vec<WatchHandle>>,
    child_watches: HashMap<String, Vec<WatchHandle>>,
}

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    version: i32,
    ephemeral_owner: Option<u64>,
    seq_counter: u64,
}

impl Node {
    fn new(data: Bytes, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            seq_counter: 0,
        }
    }
}

#[derive(Debug)]
struct WatchHandle {
    owner: u64,
    tx: oneshot::Sender<WatchEvent>,
}

/// A change that must wake watches, recorded while applying a batch and fired
/// after it commits.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Change {
    Created,
    DataChanged,
    Deleted,
}

impl Default for MemKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKeeper {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new(), None));
        Self {
            inner: Arc::new(MemInner {
                state: Mutex::new(State {
                    nodes,
                    ..Default::default()
                }),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Kill a session: its ephemeral nodes are removed and every watch it
    /// registered fires with [`WatchKind::SessionExpired`].
    pub fn expire_session(&self, session_id: u64) {
        let (token, events) = {
            let mut state = self.inner.state.lock();
            let Some(token) = state.sessions.remove(&session_id) else {
                return;
            };

            let ephemerals: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
                .map(|(path, _)| path.clone())
                .collect();

            let mut events = Vec::new();
            for path in ephemerals {
                state.nodes.remove(&path);
                events.push((path, Change::Deleted));
            }

            // Watches owned by the dead session fire with a session event so
            // waiters are not left hanging.
            let state = &mut *state;
            for watches in state
                .node_watches
                .values_mut()
                .chain(state.child_watches.values_mut())
            {
                let mut kept = Vec::with_capacity(watches.len());
                for handle in watches.drain(..) {
                    if handle.owner == session_id {
                        let _ = handle.tx.send(WatchEvent {
                            path: String::new(),
                            kind: WatchKind::SessionExpired,
                        });
                    } else {
                        kept.push(handle);
                    }
                }
                *watches = kept;
            }

            state.fire_all(&events);
            (token, events)
        };
        debug!(session_id, removed_ephemerals = events.len(), "expired keeper session");
        token.cancel();
    }

    fn connect_session(&self) -> Arc<dyn Keeper> {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        self.inner.state.lock().sessions.insert(id, token.clone());
        Arc::new(MemSession {
            server: Arc::clone(&self.inner),
            id,
            token,
        })
    }
}

#[async_trait::async_trait]
impl KeeperConnector for MemKeeper {
    async fn connect(&self) -> Result<Arc<dyn Keeper>> {
        Ok(self.connect_session())
    }
}

impl State {
    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    fn check_version(node: &Node, path: &str, version: Option<i32>) -> Result<()> {
        match version {
            Some(expected) if expected != node.version => Err(Error::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.version,
            }),
            _ => Ok(()),
        }
    }

    fn children_of<'a>(
        nodes: &'a BTreeMap<String, Node>,
        path: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        let prefix: String = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let skip = prefix.len();
        nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter_map(move |(k, _)| {
                let rest = &k[skip..];
                (!rest.is_empty() && !rest.contains('/')).then_some(rest)
            })
    }

    fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        Self::children_of(nodes, path).next().is_some()
    }

    /// Apply one op to `nodes`, recording watch events to fire on commit.
    fn apply(
        nodes: &mut BTreeMap<String, Node>,
        session: u64,
        op: &Op,
        events: &mut Vec<(String, Change)>,
    ) -> Result<OpResult> {
        match op {
            Op::Create { path, data, mode } => {
                let parent = parent_path(path).ok_or_else(|| Error::NoNode(path.to_string()))?;
                {
                    let parent_node = nodes
                        .get(parent)
                        .ok_or_else(|| Error::NoNode(parent.to_string()))?;
                    if parent_node.ephemeral_owner.is_some() {
                        return Err(Error::EphemeralParent(parent.to_string()));
                    }
                }

                let full_path = if mode.is_sequential() {
                    let parent_node = nodes.get_mut(parent).expect("parent checked above");
                    let seq = parent_node.seq_counter;
                    parent_node.seq_counter += 1;
                    format!("{path}{seq:010}")
                } else {
                    path.clone()
                };

                if nodes.contains_key(&full_path) {
                    return Err(Error::NodeExists(full_path));
                }

                let owner = mode.is_ephemeral().then_some(session);
                nodes.insert(full_path.clone(), Node::new(data.clone(), owner));
                events.push((full_path.clone(), Change::Created));
                Ok(OpResult::Created(full_path))
            }
            Op::Set {
                path,
                data,
                version,
            } => {
                let node = nodes
                    .get_mut(path)
                    .ok_or_else(|| Error::NoNode(path.to_string()))?;
                Self::check_version(node, path, *version)?;
                node.data = data.clone();
                node.version += 1;
                let stat = Stat {
                    version: node.version,
                };
                events.push((path.clone(), Change::DataChanged));
                Ok(OpResult::Set(stat))
            }
            Op::Remove { path, version } => {
                let node = nodes
                    .get(path)
                    .ok_or_else(|| Error::NoNode(path.to_string()))?;
                Self::check_version(node, path, *version)?;
                if Self::has_children(nodes, path) {
                    return Err(Error::NotEmpty(path.to_string()));
                }
                nodes.remove(path);
                events.push((path.clone(), Change::Deleted));
                Ok(OpResult::Removed)
            }
            Op::Check { path, version } => {
                let node = nodes
                    .get(path)
                    .ok_or_else(|| Error::NoNode(path.to_string()))?;
                Self::check_version(node, path, Some(*version))?;
                Ok(OpResult::Checked)
            }
        }
    }

    fn fire_all(&mut self, events: &[(String, Change)]) {
        for (path, change) in events {
            let kind = match change {
                Change::Created => WatchKind::Created,
                Change::DataChanged => WatchKind::DataChanged,
                Change::Deleted => WatchKind::Deleted,
            };
            if let Some(watches) = self.node_watches.remove(path) {
                for handle in watches {
                    let _ = handle.tx.send(WatchEvent {
                        path: path.clone(),
                        kind,
                    });
                }
            }
            if *change != Change::DataChanged {
                if let Some(watches) = parent_path(path).and_then(|p| self.child_watches.remove(p))
                {
                    let parent = parent_path(path).expect("checked above");
                    for handle in watches {
                        let _ = handle.tx.send(WatchEvent {
                            path: parent.to_string(),
                            kind: WatchKind::ChildrenChanged,
                        });
                    }
                }
            }
        }
    }

    fn register_node_watch(&mut self, session: u64, path: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.node_watches
            .entry(path.to_string())
            .or_default()
            .push(WatchHandle { owner: session, tx });
        rx
    }

    fn register_child_watch(&mut self, session: u64, path: &str) -> Watch {
        let (tx, rx) = oneshot::channel();
        self.child_watches
            .entry(path.to_string())
            .or_default()
            .push(WatchHandle { owner: session, tx });
        rx
    }
}

#[derive(Debug)]
struct MemSession {
    server: Arc<MemInner>,
    id: u64,
    token: CancellationToken,
}

impl MemSession {
    fn guard(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::SessionExpired)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Keeper for MemSession {
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String> {
        let results = self.multi(vec![Op::create(path, data, mode)]).await?;
        match results.into_iter().next() {
            Some(OpResult::Created(full_path)) => Ok(full_path),
            _ => unreachable!("create op yields a Created result"),
        }
    }

    async fn get(&self, path: &str) -> Result<(Bytes, Stat)> {
        self.guard()?;
        let state = self.server.state.lock();
        let node = state.node(path)?;
        Ok((
            node.data.clone(),
            Stat {
                version: node.version,
            },
        ))
    }

    async fn try_get(&self, path: &str) -> Result<Option<(Bytes, Stat)>> {
        match self.get(path).await {
            Ok(found) => Ok(Some(found)),
            Err(Error::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_w(&self, path: &str) -> Result<(Bytes, Stat, Watch)> {
        self.guard()?;
        let mut state = self.server.state.lock();
        let (data, stat) = {
            let node = state.node(path)?;
            (
                node.data.clone(),
                Stat {
                    version: node.version,
                },
            )
        };
        let watch = state.register_node_watch(self.id, path);
        Ok((data, stat, watch))
    }

    async fn set(&self, path: &str, data: Bytes, version: Option<i32>) -> Result<Stat> {
        let results = self.multi(vec![Op::set(path, data, version)]).await?;
        match results.into_iter().next() {
            Some(OpResult::Set(stat)) => Ok(stat),
            _ => unreachable!("set op yields a Set result"),
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.guard()?;
        let state = self.server.state.lock();
        state.node(path)?;
        Ok(State::children_of(&state.nodes, path)
            .map(str::to_string)
            .collect())
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        self.guard()?;
        let mut state = self.server.state.lock();
        state.node(path)?;
        let children = State::children_of(&state.nodes, path)
            .map(str::to_string)
            .collect();
        let watch = state.register_child_watch(self.id, path);
        Ok((children, watch))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.guard()?;
        Ok(self.server.state.lock().nodes.contains_key(path))
    }

    async fn exists_w(&self, path: &str) -> Result<(bool, Watch)> {
        self.guard()?;
        let mut state = self.server.state.lock();
        let exists = state.nodes.contains_key(path);
        let watch = state.register_node_watch(self.id, path);
        Ok((exists, watch))
    }

    async fn remove(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.multi(vec![Op::remove(path, version)]).await?;
        Ok(())
    }

    async fn try_remove(&self, path: &str) -> Result<bool> {
        match self.remove(path, None).await {
            Ok(()) => Ok(true),
            Err(Error::NoNode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>> {
        self.guard()?;
        let mut state = self.server.state.lock();

        // Apply against a scratch copy so a failing op leaves nothing behind.
        let mut scratch = state.nodes.clone();
        let mut events = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for op in &ops {
            results.push(State::apply(&mut scratch, self.id, op, &mut events)?);
        }

        state.nodes = scratch;
        state.fire_all(&events);
        Ok(results)
    }

    fn session_id(&self) -> u64 {
        self.id
    }

    fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }

    fn expiry(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session() -> (MemKeeper, Arc<dyn Keeper>) {
        let server = MemKeeper::new();
        let session = server.connect().await.unwrap();
        (server, session)
    }

    #[tokio::test]
    async fn create_get_set_remove() {
        let (_server, k) = session().await;
        k.create("/a", Bytes::from_static(b"x"), CreateMode::Persistent)
            .await
            .unwrap();
        let (data, stat) = k.get("/a").await.unwrap();
        assert_eq!(&data[..], b"x");
        assert_eq!(stat.version, 0);

        let stat = k.set("/a", Bytes::from_static(b"y"), Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);

        let err = k.set("/a", Bytes::from_static(b"z"), Some(0)).await;
        assert!(matches!(err, Err(Error::BadVersion { actual: 1, .. })));

        k.remove("/a", Some(1)).await.unwrap();
        assert!(k.try_get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let (_server, k) = session().await;
        let err = k
            .create("/a/b", Bytes::new(), CreateMode::Persistent)
            .await;
        assert!(matches!(err, Err(Error::NoNode(p)) if p == "/a"));
    }

    #[tokio::test]
    async fn remove_refuses_non_empty() {
        let (_server, k) = session().await;
        k.create("/a", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        k.create("/a/b", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(matches!(
            k.remove("/a", None).await,
            Err(Error::NotEmpty(_))
        ));
    }

    #[tokio::test]
    async fn sequential_names_are_padded_and_ordered() {
        let (_server, k) = session().await;
        k.create("/log", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let first = k
            .create("/log/log-", Bytes::new(), CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = k
            .create("/log/log-", Bytes::new(), CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(first, "/log/log-0000000000");
        assert_eq!(second, "/log/log-0000000001");
        assert_eq!(
            k.get_children("/log").await.unwrap(),
            vec!["log-0000000000", "log-0000000001"]
        );
    }

    #[tokio::test]
    async fn multi_is_atomic() {
        let (_server, k) = session().await;
        k.create("/a", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let err = k
            .multi(vec![
                Op::create("/b", Bytes::new(), CreateMode::Persistent),
                Op::check("/a", 99),
            ])
            .await;
        assert!(matches!(err, Err(Error::BadVersion { .. })));
        assert!(!k.exists("/b").await.unwrap());
    }

    #[tokio::test]
    async fn ephemerals_die_with_session_and_watches_fire() {
        let server = MemKeeper::new();
        let a = server.connect().await.unwrap();
        let b = server.connect().await.unwrap();

        a.create("/lock", Bytes::from_static(b"a"), CreateMode::Ephemeral)
            .await
            .unwrap();
        let (exists, watch) = b.exists_w("/lock").await.unwrap();
        assert!(exists);

        server.expire_session(a.session_id());
        assert!(a.is_expired());
        assert!(matches!(a.get("/lock").await, Err(Error::SessionExpired)));
        assert!(!b.exists("/lock").await.unwrap());

        let event = watch.await.unwrap();
        assert_eq!(event.kind, WatchKind::Deleted);
    }

    #[tokio::test]
    async fn child_watch_fires_once() {
        let (_server, k) = session().await;
        k.create("/q", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let (children, watch) = k.children_w("/q").await.unwrap();
        assert!(children.is_empty());

        k.create("/q/e1", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let event = watch.await.unwrap();
        assert_eq!(event.kind, WatchKind::ChildrenChanged);
    }

    #[tokio::test]
    async fn data_watch_sees_change() {
        let (_server, k) = session().await;
        k.create("/c", Bytes::from_static(b"1"), CreateMode::Persistent)
            .await
            .unwrap();
        let (_, _, watch) = k.get_w("/c").await.unwrap();
        k.set("/c", Bytes::from_static(b"2"), None).await.unwrap();
        assert_eq!(watch.await.unwrap().kind, WatchKind::DataChanged);
    }
}
