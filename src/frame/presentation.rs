// Presentation cycle - back-buffer ring bookkeeping
//
// The current index is always read back from the swap chain after a present.
// Flip models are not guaranteed to rotate round-robin, so the index is never
// computed locally.

use crate::backend::{Backend, SwapChain};
use crate::error::{FrameError, FrameResult};

pub struct PresentationCycle<B: Backend> {
    swap_chain: B::SwapChain,
    current: usize,
    presents: u64,
    /// A present went out and the next index has not been queried yet.
    awaiting_advance: bool,
}

impl<B: Backend> PresentationCycle<B> {
    pub fn new(swap_chain: B::SwapChain) -> FrameResult<Self> {
        let current = query_index::<B>(&swap_chain)?;
        log::info!(
            "Presentation cycle over {} back buffers, starting at {}",
            swap_chain.buffer_count(),
            current
        );

        Ok(Self {
            swap_chain,
            current,
            presents: 0,
            awaiting_advance: false,
        })
    }

    pub fn buffer_count(&self) -> usize {
        self.swap_chain.buffer_count()
    }

    /// Index of the back buffer that is safe to render into.
    pub fn presentable_index(&self) -> usize {
        self.current
    }

    pub fn back_buffer(&self) -> B::RenderTargetView {
        self.swap_chain.render_target_view(self.current)
    }

    #[cfg(test)]
    pub fn presents(&self) -> u64 {
        self.presents
    }

    pub fn swap_chain(&self) -> &B::SwapChain {
        &self.swap_chain
    }

    /// Display the buffer that was just rendered.
    ///
    /// `vsync_interval` 0 presents immediately; N waits for N vertical blanks.
    pub fn present(&mut self, queue: &B::Queue, vsync_interval: u32) -> FrameResult<()> {
        if self.awaiting_advance {
            log::warn!("Presenting back buffer {} twice without advancing", self.current);
        }

        // A device removed while presenting ends the session's swap chain
        self.swap_chain
            .present(queue, vsync_interval)
            .map_err(|err| match err {
                FrameError::DeviceLost => {
                    FrameError::SwapChainLost("device removed during present".to_string())
                }
                other => other,
            })?;
        self.presents += 1;
        self.awaiting_advance = true;
        log::trace!(
            "Present #{}: back buffer {} (interval {})",
            self.presents,
            self.current,
            vsync_interval
        );
        Ok(())
    }

    /// Re-query the swap chain for the buffer to render next.
    pub fn advance(&mut self) -> FrameResult<usize> {
        let next = query_index::<B>(&self.swap_chain)?;
        let expected = (self.current + 1) % self.buffer_count();
        if self.awaiting_advance && next != expected {
            log::debug!(
                "Swap chain rotated from {} to {} (round-robin would be {})",
                self.current,
                next,
                expected
            );
        }

        self.current = next;
        self.awaiting_advance = false;
        Ok(next)
    }

    /// Rebuild the swap chain in place (resize, lost surface). The caller
    /// must have drained all work that references the old back buffers.
    pub fn rebuild<F>(&mut self, rebuild: F) -> FrameResult<()>
    where
        F: FnOnce(&mut B::SwapChain) -> FrameResult<()>,
    {
        rebuild(&mut self.swap_chain)?;
        self.current = query_index::<B>(&self.swap_chain)?;
        self.awaiting_advance = false;
        log::info!(
            "Swap chain rebuilt: {} back buffers, starting at {}",
            self.buffer_count(),
            self.current
        );
        Ok(())
    }
}

fn query_index<B: Backend>(swap_chain: &B::SwapChain) -> FrameResult<usize> {
    let index = swap_chain.current_back_buffer_index()?;
    if index >= swap_chain.buffer_count() {
        return Err(FrameError::SwapChainLost(format!(
            "back buffer index {} outside ring of {}",
            index,
            swap_chain.buffer_count()
        )));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Mock, MockGpu};

    #[test]
    fn starts_at_swap_chain_index() {
        let gpu = MockGpu::new(3);
        let cycle: PresentationCycle<Mock> = PresentationCycle::new(gpu.swap_chain()).unwrap();
        assert_eq!(cycle.presentable_index(), 0);
        assert_eq!(cycle.buffer_count(), 3);
    }

    #[test]
    fn ring_returns_to_start_after_depth_presents() {
        for depth in 2..=4 {
            let gpu = MockGpu::new(depth);
            let queue = gpu.queue();
            let mut cycle: PresentationCycle<Mock> =
                PresentationCycle::new(gpu.swap_chain()).unwrap();
            let start = cycle.presentable_index();

            for _ in 0..depth {
                cycle.present(&queue, 0).unwrap();
                cycle.advance().unwrap();
            }

            assert_eq!(cycle.presentable_index(), start);
            assert_eq!(cycle.presents(), depth as u64);
        }
    }

    #[test]
    fn advance_follows_swap_chain_not_local_arithmetic() {
        let gpu = MockGpu::new(3);
        let queue = gpu.queue();
        let mut cycle: PresentationCycle<Mock> = PresentationCycle::new(gpu.swap_chain()).unwrap();

        gpu.set_next_back_buffer(2);
        cycle.present(&queue, 1).unwrap();
        assert_eq!(cycle.advance().unwrap(), 2);
        assert_eq!(cycle.presentable_index(), 2);
    }

    #[test]
    fn present_records_sync_interval() {
        let gpu = MockGpu::new(2);
        let queue = gpu.queue();
        let mut cycle: PresentationCycle<Mock> = PresentationCycle::new(gpu.swap_chain()).unwrap();

        cycle.present(&queue, 1).unwrap();
        cycle.advance().unwrap();
        cycle.present(&queue, 0).unwrap();

        let presents = gpu.presents();
        assert_eq!(presents[0].back_buffer, 0);
        assert_eq!(presents[0].sync_interval, 1);
        assert_eq!(presents[1].back_buffer, 1);
        assert_eq!(presents[1].sync_interval, 0);
    }

    #[test]
    fn lost_swap_chain_fails_present_and_keeps_index() {
        let gpu = MockGpu::new(2);
        let queue = gpu.queue();
        let mut cycle: PresentationCycle<Mock> = PresentationCycle::new(gpu.swap_chain()).unwrap();

        gpu.lose_swap_chain();
        assert!(matches!(cycle.present(&queue, 0), Err(FrameError::SwapChainLost(_))));
        assert_eq!(cycle.presentable_index(), 0);
        assert_eq!(cycle.presents(), 0);
    }

    #[test]
    fn device_removal_during_present_loses_the_swap_chain() {
        let gpu = MockGpu::new(2);
        let queue = gpu.queue();
        let mut cycle: PresentationCycle<Mock> = PresentationCycle::new(gpu.swap_chain()).unwrap();

        gpu.lose_device();
        assert!(matches!(cycle.present(&queue, 1), Err(FrameError::SwapChainLost(_))));
        assert_eq!(cycle.presents(), 0);
    }

    #[test]
    fn rebuild_requeries_index() {
        let gpu = MockGpu::new(2);
        let queue = gpu.queue();
        let mut cycle: PresentationCycle<Mock> = PresentationCycle::new(gpu.swap_chain()).unwrap();
        cycle.present(&queue, 0).unwrap();

        let rebuilt = gpu.clone();
        cycle
            .rebuild(|_| {
                rebuilt.restore_swap_chain();
                Ok(())
            })
            .unwrap();
        assert_eq!(cycle.presentable_index(), 0);
    }
}
