//! A bank transfer workload over the mock backend.
use dbworkload::prelude::*;
use mock_backend::MockConn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[allow(unused)]
use tracing::{debug, info};

pub const ACCOUNTS: &str = "accounts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankTxn {
    Read,
    Transfer,
}

impl Transaction for BankTxn {
    fn name(&self) -> &str {
        match self {
            BankTxn::Read => "read",
            BankTxn::Transfer => "transfer",
        }
    }
}

/// Reads balances and moves money between accounts. The total balance never changes.
///
/// Arguments: `accounts` (default 1000), `read_pct` (0 to 100, default 50),
/// `initial_balance` (default 1000).
pub struct Bank {
    accounts: u64,
    read_pct: u64,
    initial_balance: i64,
    rng: StdRng,
}

impl Bank {
    pub fn new(args: &WorkloadArgs) -> Result<Self, ConfigError> {
        let accounts = args.get_u64("accounts").unwrap_or(1000);
        let read_pct = args.get_u64("read_pct").unwrap_or(50);
        let initial_balance = args.parse::<i64>("initial_balance")?.unwrap_or(1000);

        if accounts < 2 {
            return Err(ConfigError::Workload(format!(
                "accounts must be at least 2, got {accounts}"
            )));
        }
        if read_pct > 100 {
            return Err(ConfigError::Workload(format!(
                "read_pct must be between 0 and 100, got {read_pct}"
            )));
        }

        Ok(Self {
            accounts,
            read_pct,
            initial_balance,
            rng: StdRng::from_entropy(),
        })
    }

    fn account(&mut self) -> String {
        self.rng.gen_range(0..self.accounts).to_string()
    }
}

impl Workload<MockConn> for Bank {
    type Txn = BankTxn;

    /// Each worker deposits the initial balance into its own stripe of accounts. Deposits add to
    /// whatever transfers already landed there, so the total stays exact while workers ramp up.
    async fn setup(&mut self, conn: &mut MockConn, ctx: SetupContext) -> Result<(), DbError> {
        let stride = ctx.concurrency.max(1) as u64;
        let mut seeded = 0;
        let mut id = ctx.worker_id as u64 % stride;
        while id < self.accounts {
            conn.add(ACCOUNTS, &id.to_string(), self.initial_balance)?;
            seeded += 1;
            id += stride;
        }
        conn.commit().await?;
        debug!("Worker {} seeded {seeded} accounts", ctx.worker_id);
        Ok(())
    }

    fn cycle(&mut self) -> Vec<BankTxn> {
        if self.rng.gen_range(0..100) < self.read_pct {
            vec![BankTxn::Read]
        } else {
            vec![BankTxn::Transfer]
        }
    }

    async fn execute(&mut self, conn: &mut MockConn, txn: &BankTxn) -> Result<(), DbError> {
        match txn {
            BankTxn::Read => {
                conn.get(ACCOUNTS, &self.account())?;
            }
            BankTxn::Transfer => {
                let from = self.account();
                let to = self.account();
                let amount = self.rng.gen_range(1..=10);
                conn.add(ACCOUNTS, &from, -amount)?;
                conn.add(ACCOUNTS, &to, amount)?;
            }
        }
        conn.commit().await
    }
}
