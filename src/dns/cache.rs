//! 报文缓存：TTL 改写 + 过期陈答 + LRU 淘汰。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tracing::debug;

/// 缓存键：(小写问题名, 问题类型)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    qtype: RecordType,
}

impl CacheKey {
    pub fn from_message(msg: &Message) -> Option<Self> {
        let q = msg.queries().first()?;
        Some(Self {
            name: q.name().to_ascii().to_lowercase(),
            qtype: q.query_type(),
        })
    }
}

struct CacheEntry {
    reply: Message,
    expires_at: Instant,
}

/// 缓存命中
pub enum CacheHit {
    /// TTL 已改写为剩余寿命
    Fresh(Message),
    /// 已过期：TTL 置 1 返回，调用方应触发一次后台刷新
    Stale(Message),
}

/// DNS 报文 LRU 缓存。
///
/// 过期条目不立即清除：命中时以 TTL=1 陈答并交由解析器后台刷新，
/// 空间不足时从最久未用端淘汰。
pub struct MessageCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    // 队尾最新，队首最旧
    order: VecDeque<CacheKey>,
}

impl MessageCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        let (mut reply, remaining) = {
            let entry = inner.entries.get(key)?;
            (
                entry.reply.clone(),
                entry.expires_at.saturating_duration_since(now),
            )
        };

        touch_order(&mut inner.order, key);

        if remaining > Duration::ZERO {
            set_message_ttl(&mut reply, remaining.as_secs().max(1) as u32);
            Some(CacheHit::Fresh(reply))
        } else {
            // 过期不出原始 TTL，统一陈答 1 秒
            set_message_ttl(&mut reply, 1);
            Some(CacheHit::Stale(reply))
        }
    }

    /// 写入应答；过期时刻取各 answer 的最小 TTL
    pub fn put(&self, key: CacheKey, reply: &Message) {
        let Some(ttl) = message_min_ttl(reply) else {
            return; // 无可缓存的记录
        };

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                reply: reply.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl as u64),
            },
        );
        touch_order(&mut inner.order, &key);

        while inner.entries.len() > self.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                debug!(name = oldest.name.as_str(), "dns cache evicted");
            } else {
                break;
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.remove(key);
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.order.clear();
    }
}

fn touch_order(order: &mut VecDeque<CacheKey>, key: &CacheKey) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
    order.push_back(key.clone());
}

/// 全部 answer/authority/additional 的 TTL 统一改写
pub fn set_message_ttl(msg: &mut Message, ttl: u32) {
    let answers: Vec<_> = msg
        .take_answers()
        .into_iter()
        .map(|mut r| {
            r.set_ttl(ttl);
            r
        })
        .collect();
    msg.insert_answers(answers);

    let name_servers: Vec<_> = msg
        .take_name_servers()
        .into_iter()
        .map(|mut r| {
            r.set_ttl(ttl);
            r
        })
        .collect();
    msg.insert_name_servers(name_servers);

    let additionals: Vec<_> = msg
        .take_additionals()
        .into_iter()
        .map(|mut r| {
            r.set_ttl(ttl);
            r
        })
        .collect();
    msg.insert_additionals(additionals);
}

fn message_min_ttl(msg: &Message) -> Option<u32> {
    msg.answers()
        .iter()
        .chain(msg.name_servers())
        .map(|r| r.ttl())
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn make_reply(host: &str, ip: &str, ttl: u32) -> Message {
        let name = Name::from_str(host).unwrap();
        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(name.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(name, ttl, RData::A(A(ip.parse().unwrap()))));
        msg
    }

    #[test]
    fn fresh_hit_rewrites_ttl_to_remaining() {
        let cache = MessageCache::new(16);
        let reply = make_reply("example.com.", "1.2.3.4", 300);
        let key = CacheKey::from_message(&reply).unwrap();

        cache.put(key.clone(), &reply);
        match cache.get(&key).unwrap() {
            CacheHit::Fresh(msg) => {
                let ttl = msg.answers()[0].ttl();
                assert!(ttl <= 300 && ttl >= 299, "ttl {}", ttl);
            }
            CacheHit::Stale(_) => panic!("expected fresh"),
        }
    }

    #[test]
    fn miss_returns_none() {
        let cache = MessageCache::new(16);
        let reply = make_reply("example.com.", "1.2.3.4", 300);
        let key = CacheKey::from_message(&reply).unwrap();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn stale_hit_serves_ttl_one() {
        let cache = MessageCache::new(16);
        // TTL 0 使条目立即过期
        let reply = make_reply("example.com.", "1.2.3.4", 0);
        let key = CacheKey::from_message(&reply).unwrap();

        cache.put(key.clone(), &reply);
        match cache.get(&key).unwrap() {
            CacheHit::Stale(msg) => assert_eq!(msg.answers()[0].ttl(), 1),
            CacheHit::Fresh(_) => panic!("expected stale"),
        }
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = MessageCache::new(2);
        let replies: Vec<Message> = (0..3)
            .map(|i| make_reply(&format!("host{}.test.", i), "1.2.3.4", 300))
            .collect();
        let keys: Vec<CacheKey> = replies
            .iter()
            .map(|r| CacheKey::from_message(r).unwrap())
            .collect();

        cache.put(keys[0].clone(), &replies[0]);
        cache.put(keys[1].clone(), &replies[1]);
        // 访问 host0 让 host1 成为最旧
        let _ = cache.get(&keys[0]);
        cache.put(keys[2].clone(), &replies[2]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&keys[0]).is_some());
        assert!(cache.get(&keys[1]).is_none());
        assert!(cache.get(&keys[2]).is_some());
    }

    #[test]
    fn key_is_case_insensitive() {
        let lower = make_reply("example.com.", "1.2.3.4", 60);
        let upper = make_reply("EXAMPLE.COM.", "1.2.3.4", 60);
        assert_eq!(
            CacheKey::from_message(&lower).unwrap(),
            CacheKey::from_message(&upper).unwrap()
        );
    }

    #[test]
    fn reply_without_records_not_cached() {
        let cache = MessageCache::new(16);
        let mut msg = Message::new();
        msg.add_query(Query::query(
            Name::from_str("empty.test.").unwrap(),
            RecordType::A,
        ));
        let key = CacheKey::from_message(&msg).unwrap();
        cache.put(key.clone(), &msg);
        assert!(cache.get(&key).is_none());
    }
}
