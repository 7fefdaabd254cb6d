//! In-memory store adapter.
//!
//! Local-only backend used for development, single-process deployments and
//! the test suite. Process crash loses everything; production deployments
//! plug a persistent adapter into the same traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::data::error::StoreError;
use crate::data::traits::{
    MessagesRepository, Store, SubsRepository, TopicsRepository, UsersRepository,
};
use crate::data::types::{
    CredentialRow, DelRange, DelTransaction, FoundSub, MessageRow, QueryOpts, SubPatch,
    SubscriptionRow, TopicPatch, TopicRow, UserPatch, UserRow,
};
use crate::domain::types::{Uid, p2p_uids};

struct StoredMessage {
    row: MessageRow,
    hard_del_id: Option<u64>,
    soft_del: HashMap<Uid, u64>,
}

struct DelLogEntry {
    del_id: u64,
    user: Option<Uid>,
    ranges: Vec<DelRange>,
}

#[derive(Default)]
struct State {
    users: HashMap<Uid, UserRow>,
    topics: HashMap<String, TopicRow>,
    subs: HashMap<(String, Uid), SubscriptionRow>,
    messages: HashMap<String, Vec<StoredMessage>>,
    dellog: HashMap<String, Vec<DelLogEntry>>,
    creds: Vec<CredentialRow>,
}

/// In-memory store. One instance implements all four repositories over a
/// single lock.
pub struct MemoryStore {
    state: RwLock<State>,
    masked_namespaces: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Self::with_masked_namespaces(Vec::new())
    }

    /// Tag namespaces excluded from `find_subs` results.
    pub fn with_masked_namespaces(masked_namespaces: Vec<String>) -> Arc<Self> {
        Arc::new(MemoryStore {
            state: RwLock::new(State::default()),
            masked_namespaces,
        })
    }

    /// Bundle this adapter into a [`Store`] handle.
    pub fn store(self: &Arc<Self>) -> Store {
        Store::new(self.clone(), self.clone(), self.clone(), self.clone())
    }

    /// Seed a user row. Account management is the auth layer's business;
    /// this is the hook it (and the tests) use.
    pub fn put_user(&self, user: UserRow) {
        self.state.write().users.insert(user.uid, user);
    }

    fn tag_masked(&self, tag: &str) -> bool {
        match tag.split_once(':') {
            Some((ns, _)) => self.masked_namespaces.iter().any(|m| m == ns),
            None => false,
        }
    }
}

fn apply_limit<T>(mut rows: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit
        && rows.len() > limit
    {
        rows.drain(..rows.len() - limit);
    }
    rows
}

fn join_topic(state: &State, sub: &mut SubscriptionRow) {
    if let Some(topic) = state.topics.get(&sub.topic) {
        sub.seq_id = topic.seq_id;
        sub.touched = Some(topic.touched);
        sub.public = topic.public.clone();
    }
    // For p2p the joined public describes the counterpart, not the topic.
    if let Some((a, b)) = p2p_uids(&sub.topic) {
        let other = if sub.user == a { b } else { a };
        if let Some(user) = state.users.get(&other) {
            sub.public = user.public.clone();
            sub.last_seen = user.last_seen;
            sub.user_agent = Some(user.user_agent.clone());
        }
    }
}

fn join_user(state: &State, sub: &mut SubscriptionRow) {
    if let Some(user) = state.users.get(&sub.user) {
        sub.public = user.public.clone();
        sub.last_seen = user.last_seen;
        sub.user_agent = Some(user.user_agent.clone());
    }
}

#[async_trait]
impl UsersRepository for MemoryStore {
    async fn get(&self, uid: Uid) -> Result<Option<UserRow>, StoreError> {
        Ok(self.state.read().users.get(&uid).cloned())
    }

    async fn get_all(&self, uids: &[Uid]) -> Result<Vec<UserRow>, StoreError> {
        let state = self.state.read();
        Ok(uids
            .iter()
            .filter_map(|uid| state.users.get(uid).cloned())
            .collect())
    }

    async fn get_topics(
        &self,
        uid: Uid,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<SubscriptionRow> = state
            .subs
            .values()
            .filter(|s| s.user == uid && s.deleted_at.is_none())
            .filter(|s| match opts.if_modified_since {
                Some(ims) => s.updated > ims,
                None => true,
            })
            .cloned()
            .collect();
        for sub in &mut rows {
            join_topic(&state, sub);
        }
        rows.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(apply_limit(rows, opts.limit))
    }

    async fn get_topics_any(
        &self,
        uid: Uid,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<SubscriptionRow> = state
            .subs
            .values()
            .filter(|s| s.user == uid)
            .cloned()
            .collect();
        for sub in &mut rows {
            join_topic(&state, sub);
        }
        rows.sort_by(|a, b| b.updated.cmp(&a.updated));
        Ok(apply_limit(rows, opts.limit))
    }

    async fn find_subs(
        &self,
        uid: Uid,
        required: &[String],
        opts: &QueryOpts,
    ) -> Result<Vec<FoundSub>, StoreError> {
        let required: Vec<&String> = required.iter().filter(|t| !self.tag_masked(t)).collect();
        if required.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read();
        let mut found = Vec::new();
        for user in state.users.values() {
            if user.uid == uid {
                continue;
            }
            if required.iter().all(|t| user.tags.contains(t)) {
                found.push(FoundSub {
                    topic: None,
                    user: Some(user.uid),
                    public: user.public.clone(),
                    tags: user
                        .tags
                        .iter()
                        .filter(|t| !self.tag_masked(t))
                        .cloned()
                        .collect(),
                });
            }
        }
        for topic in state.topics.values() {
            if !topic.name.starts_with("grp") {
                continue;
            }
            if required.iter().all(|t| topic.tags.contains(t)) {
                found.push(FoundSub {
                    topic: Some(topic.name.clone()),
                    user: None,
                    public: topic.public.clone(),
                    tags: topic
                        .tags
                        .iter()
                        .filter(|t| !self.tag_masked(t))
                        .cloned()
                        .collect(),
                });
            }
        }
        Ok(apply_limit(found, opts.limit))
    }

    async fn update(&self, uid: Uid, patch: &UserPatch) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let user = state.users.get_mut(&uid).ok_or(StoreError::NotFound)?;
        if let Some(updated) = patch.updated {
            user.updated = updated;
        }
        if let Some(access) = patch.access {
            user.access = access;
        }
        if let Some(public) = &patch.public {
            user.public = Some(public.clone());
        }
        if let Some(tags) = &patch.tags {
            user.tags = tags.clone();
        }
        Ok(())
    }

    async fn update_last_seen(
        &self,
        uid: Uid,
        user_agent: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let user = state.users.get_mut(&uid).ok_or(StoreError::NotFound)?;
        user.last_seen = Some(when);
        user.user_agent = user_agent.to_string();
        Ok(())
    }

    async fn get_all_creds(
        &self,
        uid: Uid,
        valid_only: bool,
    ) -> Result<Vec<CredentialRow>, StoreError> {
        Ok(self
            .state
            .read()
            .creds
            .iter()
            .filter(|c| c.user == uid && (!valid_only || c.done))
            .cloned()
            .collect())
    }

    async fn upsert_cred(&self, cred: &CredentialRow) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state
            .creds
            .retain(|c| !(c.user == cred.user && c.method == cred.method && c.value == cred.value));
        state.creds.push(cred.clone());
        Ok(())
    }

    async fn delete_cred(&self, uid: Uid, method: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let before = state.creds.len();
        state
            .creds
            .retain(|c| !(c.user == uid && c.method == method && c.value == value));
        if state.creds.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl TopicsRepository for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<TopicRow>, StoreError> {
        Ok(self.state.read().topics.get(name).cloned())
    }

    async fn create(&self, topic: &TopicRow, subs: &[SubscriptionRow]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.topics.contains_key(&topic.name) {
            return Err(StoreError::Duplicate);
        }
        state.topics.insert(topic.name.clone(), topic.clone());
        for sub in subs {
            state
                .subs
                .insert((sub.topic.clone(), sub.user), sub.clone());
        }
        Ok(())
    }

    async fn update(&self, name: &str, patch: &TopicPatch) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let topic = state.topics.get_mut(name).ok_or(StoreError::NotFound)?;
        if let Some(updated) = patch.updated {
            topic.updated = updated;
        }
        if let Some(touched) = patch.touched {
            topic.touched = touched;
        }
        if let Some(seq_id) = patch.seq_id {
            topic.seq_id = seq_id;
        }
        if let Some(del_id) = patch.del_id {
            topic.del_id = del_id;
        }
        if let Some(owner) = patch.owner {
            topic.owner = owner;
        }
        if let Some(access) = patch.access {
            topic.access = access;
        }
        if let Some(public) = &patch.public {
            topic.public = Some(public.clone());
        }
        if let Some(tags) = &patch.tags {
            topic.tags = tags.clone();
        }
        Ok(())
    }

    async fn get_subs(
        &self,
        name: &str,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let state = self.state.read();
        let rows: Vec<SubscriptionRow> = state
            .subs
            .values()
            .filter(|s| s.topic == name && s.deleted_at.is_none())
            .filter(|s| match opts.user {
                Some(user) => s.user == user,
                None => true,
            })
            .cloned()
            .collect();
        Ok(apply_limit(rows, opts.limit))
    }

    async fn get_subs_any(
        &self,
        name: &str,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let state = self.state.read();
        let rows: Vec<SubscriptionRow> = state
            .subs
            .values()
            .filter(|s| s.topic == name)
            .cloned()
            .collect();
        Ok(apply_limit(rows, opts.limit))
    }

    async fn get_users(
        &self,
        name: &str,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<SubscriptionRow> = state
            .subs
            .values()
            .filter(|s| s.topic == name && s.deleted_at.is_none())
            .filter(|s| match opts.user {
                Some(user) => s.user == user,
                None => true,
            })
            .cloned()
            .collect();
        for sub in &mut rows {
            join_user(&state, sub);
        }
        Ok(apply_limit(rows, opts.limit))
    }

    async fn get_users_any(
        &self,
        name: &str,
        opts: &QueryOpts,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<SubscriptionRow> = state
            .subs
            .values()
            .filter(|s| s.topic == name)
            .cloned()
            .collect();
        for sub in &mut rows {
            join_user(&state, sub);
        }
        Ok(apply_limit(rows, opts.limit))
    }

    async fn owner_change(&self, name: &str, new_owner: Uid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let topic = state.topics.get_mut(name).ok_or(StoreError::NotFound)?;
        topic.owner = new_owner;
        topic.updated = Utc::now();
        Ok(())
    }

    async fn delete(&self, name: &str, _hard: bool) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.topics.remove(name).is_none() {
            return Err(StoreError::NotFound);
        }
        state.subs.retain(|(topic, _), _| topic != name);
        state.messages.remove(name);
        state.dellog.remove(name);
        Ok(())
    }
}

#[async_trait]
impl SubsRepository for MemoryStore {
    async fn get(&self, topic: &str, user: Uid) -> Result<Option<SubscriptionRow>, StoreError> {
        Ok(self
            .state
            .read()
            .subs
            .get(&(topic.to_string(), user))
            .cloned())
    }

    async fn create(&self, sub: &SubscriptionRow) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let key = (sub.topic.clone(), sub.user);
        if let Some(existing) = state.subs.get(&key)
            && existing.deleted_at.is_none()
        {
            return Err(StoreError::Duplicate);
        }
        state.subs.insert(key, sub.clone());
        Ok(())
    }

    async fn update(&self, topic: &str, user: Uid, patch: &SubPatch) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let sub = state
            .subs
            .get_mut(&(topic.to_string(), user))
            .ok_or(StoreError::NotFound)?;
        if let Some(updated) = patch.updated {
            sub.updated = updated;
        }
        if let Some(want) = patch.mode_want {
            sub.mode_want = want;
        }
        if let Some(given) = patch.mode_given {
            sub.mode_given = given;
        }
        if let Some(read) = patch.read_seq_id {
            sub.read_seq_id = read;
        }
        if let Some(recv) = patch.recv_seq_id {
            sub.recv_seq_id = recv;
        }
        if let Some(del_id) = patch.del_id {
            sub.del_id = del_id;
        }
        if let Some(private) = &patch.private {
            sub.private = Some(private.clone());
        }
        if patch.clear_deleted {
            sub.deleted_at = None;
        }
        Ok(())
    }

    async fn delete(&self, topic: &str, user: Uid, hard: bool) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let key = (topic.to_string(), user);
        if hard {
            state.subs.remove(&key).ok_or(StoreError::NotFound)?;
        } else {
            let sub = state.subs.get_mut(&key).ok_or(StoreError::NotFound)?;
            if sub.deleted_at.is_some() {
                return Err(StoreError::NotFound);
            }
            sub.deleted_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl MessagesRepository for MemoryStore {
    async fn save(&self, msg: &MessageRow) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let log = state.messages.entry(msg.topic.clone()).or_default();
        if log.iter().any(|m| m.row.seq_id == msg.seq_id) {
            return Err(StoreError::Duplicate);
        }
        log.push(StoredMessage {
            row: msg.clone(),
            hard_del_id: None,
            soft_del: HashMap::new(),
        });
        Ok(())
    }

    async fn get_all(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<MessageRow> = state
            .messages
            .get(topic)
            .map(|log| {
                log.iter()
                    .filter(|m| m.hard_del_id.is_none() && !m.soft_del.contains_key(&for_user))
                    .filter(|m| match opts.since_id {
                        Some(since) => m.row.seq_id >= since,
                        None => true,
                    })
                    .filter(|m| match opts.before_id {
                        Some(before) => m.row.seq_id < before,
                        None => true,
                    })
                    .map(|m| m.row.clone())
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|m| m.seq_id);
        Ok(apply_limit(rows, opts.limit))
    }

    async fn get_deleted(
        &self,
        topic: &str,
        for_user: Uid,
        opts: &QueryOpts,
    ) -> Result<(Vec<DelRange>, u64), StoreError> {
        let state = self.state.read();
        let since = opts.since_id.unwrap_or(0);
        let mut ranges = Vec::new();
        let mut max_del_id = 0;
        if let Some(log) = state.dellog.get(topic) {
            for entry in log {
                max_del_id = max_del_id.max(entry.del_id);
                if entry.del_id <= since {
                    continue;
                }
                if entry.user.is_none() || entry.user == Some(for_user) {
                    ranges.extend_from_slice(&entry.ranges);
                }
            }
        }
        ranges.sort_by_key(|r| r.low);
        Ok((ranges, max_del_id))
    }

    async fn delete_list(&self, topic: &str, del: &DelTransaction) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(log) = state.messages.get_mut(topic) {
            for msg in log.iter_mut() {
                if !del.ranges.iter().any(|r| r.contains(msg.row.seq_id)) {
                    continue;
                }
                match del.user {
                    Some(user) => {
                        msg.soft_del.insert(user, del.del_id);
                    }
                    None => {
                        msg.hard_del_id = Some(del.del_id);
                        msg.row.content = serde_json::Value::Null;
                        msg.row.head = None;
                        msg.row.from = Uid::ZERO;
                    }
                }
            }
        }
        state.dellog.entry(topic.to_string()).or_default().push(DelLogEntry {
            del_id: del.del_id,
            user: del.user,
            ranges: del.ranges.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::DefaultAccess;
    use crate::domain::access::AccessMode;

    fn user(uid: u64, tags: &[&str]) -> UserRow {
        let now = Utc::now();
        UserRow {
            uid: Uid::new(uid),
            created: now,
            updated: now,
            state: Default::default(),
            access: DefaultAccess {
                auth: AccessMode::AUTH,
                anon: AccessMode::NONE,
            },
            public: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            last_seen: None,
            user_agent: String::new(),
        }
    }

    fn topic(name: &str, owner: u64) -> TopicRow {
        let now = Utc::now();
        TopicRow {
            name: name.to_string(),
            created: now,
            updated: now,
            touched: now,
            owner: Uid::new(owner),
            seq_id: 0,
            del_id: 0,
            access: DefaultAccess::default(),
            public: None,
            tags: Vec::new(),
            is_chan: false,
        }
    }

    fn message(topic: &str, seq: u64, from: u64) -> MessageRow {
        MessageRow {
            topic: topic.to_string(),
            seq_id: seq,
            from: Uid::new(from),
            ts: Utc::now(),
            head: None,
            content: serde_json::json!("hello"),
        }
    }

    #[tokio::test]
    async fn test_save_rejects_duplicate_seq() {
        let store = MemoryStore::new();
        store.save(&message("grp1", 1, 7)).await.unwrap();
        let err = store.save(&message("grp1", 1, 7)).await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_sub_create_update_delete() {
        let store = MemoryStore::new();
        let uid = Uid::new(7);
        let sub = SubscriptionRow::new("grp1", uid, AccessMode::AUTH, AccessMode::AUTH);
        SubsRepository::create(&*store, &sub).await.unwrap();
        assert!(
            SubsRepository::create(&*store, &sub)
                .await
                .unwrap_err()
                .is_duplicate()
        );

        SubsRepository::update(
            &*store,
            "grp1",
            uid,
            &SubPatch {
                read_seq_id: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let row = SubsRepository::get(&*store, "grp1", uid).await.unwrap().unwrap();
        assert_eq!(row.read_seq_id, 4);

        SubsRepository::delete(&*store, "grp1", uid, false).await.unwrap();
        let row = SubsRepository::get(&*store, "grp1", uid).await.unwrap().unwrap();
        assert!(row.deleted_at.is_some());

        // Soft-deleted rows may be re-created.
        SubsRepository::create(&*store, &sub).await.unwrap();
    }

    #[tokio::test]
    async fn test_soft_and_hard_delete_visibility() {
        let store = MemoryStore::new();
        let alice = Uid::new(1);
        let bob = Uid::new(2);
        for seq in 1..=4 {
            store.save(&message("grp1", seq, 1)).await.unwrap();
        }

        // Soft delete 1..3 for alice only.
        store
            .delete_list(
                "grp1",
                &DelTransaction {
                    del_id: 1,
                    user: Some(alice),
                    ranges: vec![DelRange { low: 1, hi: 3 }],
                },
            )
            .await
            .unwrap();

        let opts = QueryOpts::default();
        let for_alice = MessagesRepository::get_all(&*store, "grp1", alice, &opts)
            .await
            .unwrap();
        assert_eq!(
            for_alice.iter().map(|m| m.seq_id).collect::<Vec<_>>(),
            vec![3, 4]
        );
        let for_bob = MessagesRepository::get_all(&*store, "grp1", bob, &opts)
            .await
            .unwrap();
        assert_eq!(for_bob.len(), 4);

        // Hard delete 4 for everyone.
        store
            .delete_list(
                "grp1",
                &DelTransaction {
                    del_id: 2,
                    user: None,
                    ranges: vec![DelRange { low: 4, hi: 5 }],
                },
            )
            .await
            .unwrap();
        let for_bob = MessagesRepository::get_all(&*store, "grp1", bob, &opts)
            .await
            .unwrap();
        assert_eq!(
            for_bob.iter().map(|m| m.seq_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let (ranges, max_del) = store.get_deleted("grp1", bob, &opts).await.unwrap();
        assert_eq!(max_del, 2);
        assert_eq!(ranges, vec![DelRange { low: 4, hi: 5 }]);
        let (ranges, _) = store.get_deleted("grp1", alice, &opts).await.unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[tokio::test]
    async fn test_find_subs_masks_namespaces() {
        let store = MemoryStore::with_masked_namespaces(vec!["email".into()]);
        store.put_user(user(1, &[]));
        store.put_user(user(2, &["travel", "email:bob@example.com"]));

        let me = Uid::new(1);
        let found = store
            .find_subs(me, &["travel".to_string()], &QueryOpts::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user, Some(Uid::new(2)));
        assert!(found[0].tags.iter().all(|t| !t.starts_with("email:")));

        // Masked tags cannot be searched on.
        let found = store
            .find_subs(
                me,
                &["email:bob@example.com".to_string()],
                &QueryOpts::default(),
            )
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_owner_change() {
        let store = MemoryStore::new();
        TopicsRepository::create(&*store, &topic("grp1", 1), &[])
            .await
            .unwrap();
        store.owner_change("grp1", Uid::new(2)).await.unwrap();
        let row = TopicsRepository::get(&*store, "grp1").await.unwrap().unwrap();
        assert_eq!(row.owner, Uid::new(2));
    }

    #[tokio::test]
    async fn test_topic_delete_cascades() {
        let store = MemoryStore::new();
        TopicsRepository::create(
            &*store,
            &topic("grp1", 1),
            &[SubscriptionRow::new(
                "grp1",
                Uid::new(1),
                AccessMode::AUTH,
                AccessMode::AUTH,
            )],
        )
        .await
        .unwrap();
        store.save(&message("grp1", 1, 1)).await.unwrap();

        TopicsRepository::delete(&*store, "grp1", true).await.unwrap();
        assert!(TopicsRepository::get(&*store, "grp1").await.unwrap().is_none());
        assert!(
            SubsRepository::get(&*store, "grp1", Uid::new(1))
                .await
                .unwrap()
                .is_none()
        );
        let msgs = MessagesRepository::get_all(&*store, "grp1", Uid::new(1), &QueryOpts::default())
            .await
            .unwrap();
        assert!(msgs.is_empty());
    }
}
