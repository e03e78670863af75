// Named cross-process objects: mapped region, mutex and auto-reset events.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{NamedEvent, NamedMutex, NamedMutexGuard, SharedRegion};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::{NamedEvent, NamedMutex, NamedMutexGuard, SharedRegion};

/// Name of the mutex guarding region `name`.
pub fn mutex_name(name: &str) -> String {
    format!("{}_Mutex", name)
}

/// Name of the event signalled when a command is written.
pub fn command_event_name(name: &str) -> String {
    format!("{}_Command", name)
}

/// Name of the event signalled when a result is written.
pub fn result_event_name(name: &str) -> String {
    format!("{}_Result", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn unique(prefix: &str) -> String {
        format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn derived_names_follow_convention() {
        assert_eq!(mutex_name("Widgets"), "Widgets_Mutex");
        assert_eq!(command_event_name("Widgets"), "Widgets_Command");
        assert_eq!(result_event_name("Widgets"), "Widgets_Result");
    }

    #[test]
    fn region_is_shared_between_handles() {
        let name = unique("rgn");
        let owner = SharedRegion::create(&name, 4096).unwrap();
        let peer = SharedRegion::open(&name, 4096).unwrap();
        unsafe {
            *owner.as_ptr().add(100) = 0xAB;
            assert_eq!(*peer.as_ptr().add(100), 0xAB);
        }
        assert_eq!(peer.len(), 4096);
    }

    #[test]
    fn opening_missing_region_fails() {
        assert!(SharedRegion::open(&unique("missing"), 4096).is_err());
    }

    #[test]
    fn mutex_lock_times_out_while_held() {
        let name = unique("mtx");
        let owner = NamedMutex::create(&name).unwrap();
        let peer = NamedMutex::open(&name).unwrap();

        let guard = owner.lock(Duration::from_millis(100)).unwrap();
        assert!(guard.is_some());

        // Windows mutexes are recursive per thread, so contend from another one.
        thread::scope(|s| {
            s.spawn(|| {
                let started = Instant::now();
                assert!(peer.lock(Duration::from_millis(100)).unwrap().is_none());
                assert!(started.elapsed() >= Duration::from_millis(90));
            })
            .join()
            .unwrap();
        });

        drop(guard);
        thread::scope(|s| {
            s.spawn(|| assert!(peer.lock(Duration::from_millis(100)).unwrap().is_some()))
                .join()
                .unwrap();
        });
    }

    #[test]
    fn event_wakes_waiter_once() {
        let name = unique("evt");
        let owner = Arc::new(NamedEvent::create(&name).unwrap());
        let peer = NamedEvent::open(&name).unwrap();

        assert!(!owner.wait(Duration::from_millis(20)).unwrap());

        // Two sets before a wait collapse into one wake.
        peer.set().unwrap();
        peer.set().unwrap();
        assert!(owner.wait(Duration::from_millis(100)).unwrap());
        assert!(!owner.wait(Duration::from_millis(20)).unwrap());

        let waiter = {
            let owner = Arc::clone(&owner);
            thread::spawn(move || owner.wait(Duration::from_secs(2)).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        peer.set().unwrap();
        assert!(waiter.join().unwrap());
    }
}
