use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 20;
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_MAX_PER_IP: usize = 5;

struct Window {
    started_at: Instant,
    count: u32,
}

/// Per-IP fixed-window counter. Windows reset lazily on the next arrival
/// past expiry rather than through a background sweep.
pub struct RateLimiter {
    windows: RwLock<HashMap<IpAddr, Window>>,
    cap: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            cap,
            window,
        }
    }

    /// Returns `true` if this arrival is admitted under the per-IP window cap.
    pub fn check(&self, ip: IpAddr) -> bool {
        let mut windows = self.windows.write().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let entry = windows.entry(ip).or_insert_with(|| Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= self.cap {
            return false;
        }

        entry.count += 1;
        true
    }

    /// Drops windows untouched for at least twice the window duration.
    /// Purely a memory-reclamation sweep; correctness never depends on it.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut windows = self.windows.write().expect("rate limiter lock poisoned");
        windows.retain(|_, w| now.duration_since(w.started_at) < self.window * 2);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    Global,
    PerIp,
}

struct Inner {
    global: AtomicUsize,
    per_ip: RwLock<HashMap<IpAddr, usize>>,
    global_cap: usize,
    per_ip_cap: usize,
}

/// Live-connection accounting: an atomic global counter plus a guarded
/// per-IP map, both released automatically when the returned guard drops.
#[derive(Clone)]
pub struct ConnectionCaps(Arc<Inner>);

impl ConnectionCaps {
    pub fn new(global_cap: usize, per_ip_cap: usize) -> Self {
        Self(Arc::new(Inner {
            global: AtomicUsize::new(0),
            per_ip: RwLock::new(HashMap::new()),
            global_cap,
            per_ip_cap,
        }))
    }

    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionGuard, CapError> {
        let mut current = self.0.global.load(Ordering::SeqCst);
        loop {
            if current >= self.0.global_cap {
                return Err(CapError::Global);
            }
            match self.0.global.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let mut per_ip = self.0.per_ip.write().expect("connection cap lock poisoned");
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.0.per_ip_cap {
            drop(per_ip);
            self.0.global.fetch_sub(1, Ordering::SeqCst);
            return Err(CapError::PerIp);
        }
        *count += 1;

        Ok(ConnectionGuard {
            caps: self.clone(),
            ip,
        })
    }

    pub fn global_count(&self) -> usize {
        self.0.global.load(Ordering::SeqCst)
    }

    pub fn per_ip_count(&self, ip: IpAddr) -> usize {
        self.0
            .per_ip
            .read()
            .expect("connection cap lock poisoned")
            .get(&ip)
            .copied()
            .unwrap_or(0)
    }
}

pub struct ConnectionGuard {
    caps: ConnectionCaps,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.caps.0.global.fetch_sub(1, Ordering::SeqCst);

        let mut per_ip = self
            .caps
            .0
            .per_ip
            .write()
            .expect("connection cap lock poisoned");
        if let Some(count) = per_ip.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&self.ip);
            }
        }
    }
}
