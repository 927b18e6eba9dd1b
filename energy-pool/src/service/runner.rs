//! Energy Pool Background Runner
//!
//! 后台任务处理器，负责：
//! - 订单 worker 从支付队列取出事件并推进订单
//! - 定期清扫过期预留

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::ledger::ReservationLedger;
use crate::order::OrderLifecycleCoordinator;
use crate::storage::PoolStorage;
use crate::types::PaymentEvent;

/// 每个 worker 对应的队列深度
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// 后台运行器
pub struct BackgroundRunner<S: PoolStorage + 'static> {
    orders: Arc<OrderLifecycleCoordinator<S>>,
    ledger: Arc<ReservationLedger<S>>,
    workers: usize,
    sweep_interval: Duration,
}

impl<S: PoolStorage + 'static> BackgroundRunner<S> {
    /// 创建新的后台运行器
    pub fn new(
        orders: Arc<OrderLifecycleCoordinator<S>>,
        ledger: Arc<ReservationLedger<S>>,
        workers: usize,
        sweep_interval_secs: u64,
    ) -> Self {
        Self {
            orders,
            ledger,
            workers: workers.max(1),
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
        }
    }

    /// 启动后台运行器
    pub async fn start(self) -> RunnerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (payment_tx, payment_rx) =
            mpsc::channel::<PaymentEvent>(self.workers * QUEUE_DEPTH_PER_WORKER);
        let payment_rx = Arc::new(Mutex::new(payment_rx));
        let running = Arc::new(RwLock::new(true));

        let mut tasks = Vec::with_capacity(self.workers + 1);

        // 订单 worker：队列关闭且取空后退出
        for worker in 0..self.workers {
            let orders = self.orders.clone();
            let payment_rx = payment_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = payment_rx.lock().await.recv().await;
                    match next {
                        Some(payment) => Self::handle_payment(worker, &orders, payment).await,
                        None => break,
                    }
                }
                debug!(worker, "Order worker stopped");
            }));
        }

        // 预留清扫
        let ledger = self.ledger.clone();
        let running_clone = running.clone();
        let sweep_interval = self.sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut sweep_timer = interval(sweep_interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Background runner received shutdown signal");
                        break;
                    }
                    _ = sweep_timer.tick() => {
                        if *running_clone.read().await {
                            match ledger.sweep_expired(chrono::Utc::now()).await {
                                Ok(report) if !report.released.is_empty() => {
                                    info!(
                                        released = report.released.len(),
                                        "Released expired reservations"
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => error!("Error sweeping reservations: {}", e),
                            }
                        }
                    }
                }
            }

            info!("Reservation sweeper stopped");
        }));

        info!(workers = self.workers, "Background runner started");

        RunnerHandle {
            payment_tx,
            shutdown_tx,
            running,
            tasks,
        }
    }

    async fn handle_payment(
        worker: usize,
        orders: &Arc<OrderLifecycleCoordinator<S>>,
        payment: PaymentEvent,
    ) {
        let payment_ref = payment.payment_tx_ref.clone();
        match orders.create_order_from_payment(payment).await {
            Ok(order) => {
                info!(
                    worker,
                    order_id = %order.id,
                    payment = %payment_ref,
                    status = %order.status,
                    "Payment processed"
                );
            }
            Err(PoolError::DuplicateOrder { .. }) => {
                warn!(worker, payment = %payment_ref, "Duplicate payment ignored");
            }
            Err(e) => {
                error!(worker, payment = %payment_ref, "Error processing payment: {}", e);
            }
        }
    }
}

/// 运行器句柄
pub struct RunnerHandle {
    payment_tx: mpsc::Sender<PaymentEvent>,
    shutdown_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    /// 把支付事件放入队列
    pub async fn submit(&self, payment: PaymentEvent) -> PoolResult<()> {
        self.payment_tx
            .send(payment)
            .await
            .map_err(|_| PoolError::InvalidInput("payment queue is closed".to_string()))
    }

    /// 停止运行器
    ///
    /// 已入队的支付处理完后 worker 才退出。
    pub async fn stop(self) {
        *self.running.write().await = false;
        let _ = self.shutdown_tx.send(()).await;
        drop(self.payment_tx);

        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Background task panicked: {}", e);
            }
        }
    }

    /// 暂停清扫（worker 不受影响）
    pub async fn pause(&self) {
        *self.running.write().await = false;
    }

    /// 恢复清扫
    pub async fn resume(&self) {
        *self.running.write().await = true;
    }

    /// 检查是否运行中
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runner_handle() {
        let (payment_tx, _payment_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let handle = RunnerHandle {
            payment_tx,
            shutdown_tx,
            running: Arc::new(RwLock::new(true)),
            tasks: Vec::new(),
        };

        assert!(handle.is_running().await);

        handle.pause().await;
        assert!(!handle.is_running().await);

        handle.resume().await;
        assert!(handle.is_running().await);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_submit_after_queue_closed() {
        let (payment_tx, payment_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        drop(payment_rx);

        let handle = RunnerHandle {
            payment_tx,
            shutdown_tx,
            running: Arc::new(RwLock::new(true)),
            tasks: Vec::new(),
        };
        let payment = PaymentEvent::new("TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf", 1, "tx", "nile");
        assert!(matches!(
            handle.submit(payment).await,
            Err(PoolError::InvalidInput(_))
        ));
    }
}
