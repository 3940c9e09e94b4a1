//! 跨设备同步（link group）与就绪通知（async notifier）
//!
//! link 后的设备对 start/drop/prepare 由组整体生效；本层只负责
//! 成员簿记和请求转发，底层不支持该原语的设备报 Unsupported。
//!
//! 就绪通知每周期派发一次；订阅清单归设备句柄所有，
//! 关闭句柄时整体移除。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// link group 成员的本地（不再扇出的）控制面
pub trait LinkMember: Send + Sync {
    /// 本地 start，不经过组
    fn member_start(&self) -> Result<()>;
    /// 本地 drop，不经过组
    fn member_stop(&self) -> Result<()>;
    /// 本地 prepare，不经过组
    fn member_prepare(&self) -> Result<()>;
}

fn member_key(m: &Arc<dyn LinkMember>) -> usize {
    Arc::as_ptr(m) as *const () as usize
}

/// 一组同步启停的设备
pub struct LinkGroup {
    members: Mutex<Vec<Arc<dyn LinkMember>>>,
}

impl LinkGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, member: Arc<dyn LinkMember>) {
        let mut members = self.members.lock().unwrap();
        let key = member_key(&member);
        if members.iter().any(|m| member_key(m) == key) {
            return;
        }
        members.push(member);
    }

    /// 移除成员；不在组内返回 false
    pub fn remove(&self, member: &Arc<dyn LinkMember>) -> bool {
        let mut members = self.members.lock().unwrap();
        let key = member_key(member);
        let before = members.len();
        members.retain(|m| member_key(m) != key);
        members.len() != before
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each(&self, f: impl Fn(&Arc<dyn LinkMember>) -> Result<()>) -> Result<()> {
        let members = self.members.lock().unwrap();
        let mut first_err = None;
        for m in members.iter() {
            if let Err(e) = f(m) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 组内全部 start；逐成员执行，返回首个错误
    pub fn start_all(&self) -> Result<()> {
        self.for_each(|m| m.member_start())
    }

    /// 组内全部 drop
    pub fn stop_all(&self) -> Result<()> {
        self.for_each(|m| m.member_stop())
    }

    /// 组内全部 prepare
    pub fn prepare_all(&self) -> Result<()> {
        self.for_each(|m| m.member_prepare())
    }
}

/// 就绪通知回调
pub type AsyncCallback = Box<dyn Fn() + Send>;

/// 异步通知订阅清单
///
/// 设备句柄持有；后端在每个周期边界调用 `dispatch` 一次。
pub struct AsyncRegistry {
    next_id: AtomicU64,
    subs: Mutex<Vec<(u64, AsyncCallback)>>,
}

impl AsyncRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            subs: Mutex::new(Vec::new()),
        })
    }

    /// 登记订阅者，返回用于移除的令牌
    pub fn add(&self, cb: AsyncCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().unwrap().push((id, cb));
        id
    }

    /// 按令牌移除；不存在返回 false
    pub fn remove(&self, id: u64) -> bool {
        let mut subs = self.subs.lock().unwrap();
        let before = subs.len();
        subs.retain(|(i, _)| *i != id);
        subs.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// 向全部订阅者派发一次就绪通知
    pub fn dispatch(&self) {
        let subs = self.subs.lock().unwrap();
        for (_, cb) in subs.iter() {
            cb();
        }
    }

    /// 整体清空（关闭句柄时）
    pub fn clear(&self) {
        self.subs.lock().unwrap().clear();
    }
}
