//! Payout engine.
//!
//! The coordinator periodically settles all pending deposit taxes and
//! withdrawals in a single UTXO transaction. Every authority recomputes the
//! batch from its own chain view, so the vouts are a pure function of
//! (payouts, unspent, constants) and the co-signing walk only succeeds when
//! all nodes agree byte for byte.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::amount::{Satoshi, TaxPolicy};
use crate::db::{self, MintBinding, Withdrawal};
use crate::dingo::UnspentOutput;
use crate::error::{Error, Result};
use crate::evm::{self, BurnRecord};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositTaxPayout {
    pub deposit_address: String,
    pub amount: Satoshi,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalPayout {
    pub burn_address: String,
    pub burn_index: u64,
    pub burn_destination: String,
    pub amount: Satoshi,
}

/// Same key as its paired [`WithdrawalPayout`]; the amount is the tax share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalTaxPayout {
    pub burn_address: String,
    pub burn_index: u64,
    pub burn_destination: String,
    pub amount: Satoshi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPayouts {
    pub deposit_tax_payouts: Vec<DepositTaxPayout>,
    pub withdrawal_payouts: Vec<WithdrawalPayout>,
    pub withdrawal_tax_payouts: Vec<WithdrawalTaxPayout>,
}

impl PendingPayouts {
    pub fn is_empty(&self) -> bool {
        self.deposit_tax_payouts.is_empty()
            && self.withdrawal_payouts.is_empty()
            && self.withdrawal_tax_payouts.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputePendingPayoutsRequest {
    pub process_deposits: bool,
    pub process_withdrawals: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeUnspentRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeUnspentResponse {
    pub unspent: Vec<UnspentOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovePayoutsRequest {
    pub deposit_tax_payouts: Vec<DepositTaxPayout>,
    pub withdrawal_payouts: Vec<WithdrawalPayout>,
    pub withdrawal_tax_payouts: Vec<WithdrawalTaxPayout>,
    pub unspent: Vec<UnspentOutput>,
    pub approval_chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovePayoutsResponse {
    pub approval_chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayoutsRequest {
    pub process_deposits: bool,
    pub process_withdrawals: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayoutsResponse {
    pub approval_chain: String,
    pub txid: String,
}

/// Everything batch validation reads, prefetched so the checks stay pure.
#[derive(Debug, Default)]
pub struct ChainStateView {
    /// Fresh `listreceivedbyaddress(depositConfirmations)`.
    pub received: HashMap<String, Satoshi>,
    /// Bindings keyed by deposit address.
    pub bindings: HashMap<String, MintBinding>,
    /// Local withdrawals keyed by `(burn_address, burn_index)`.
    pub withdrawals: HashMap<(String, i64), Withdrawal>,
    /// On-chain burn records keyed by `(burn_address, burn_index)`.
    pub burns: HashMap<(String, u64), BurnRecord>,
}

/// Step A: pending payouts from this node's own chain and store view.
pub async fn compute_pending_payouts(
    state: &AppState,
    process_deposits: bool,
    process_withdrawals: bool,
) -> Result<PendingPayouts> {
    if !process_deposits && !process_withdrawals {
        return Err(Error::MalformedRequest(
            "at least one of processDeposits/processWithdrawals must be set".into(),
        ));
    }

    let policy = &state.settings.dingo_settings.tax;
    let mut pending = PendingPayouts::default();

    if process_deposits {
        let received = state
            .dingo
            .list_received_by_address(state.settings.dingo_settings.deposit_confirmations)
            .await?;
        for binding in db::get_mint_bindings(&state.pool, None).await? {
            let Some(&balance) = received.get(&binding.deposit_address) else {
                continue;
            };
            if !policy.meets_tax(balance) {
                continue;
            }
            let approvable = policy.tax(balance)?;
            let approved = binding.approved_tax;
            if approvable < approved {
                return Err(Error::AccountingInvariantViolated(format!(
                    "deposit {} has approved tax {approved} above approvable {approvable}",
                    binding.deposit_address
                )));
            }
            if approvable > approved {
                pending.deposit_tax_payouts.push(DepositTaxPayout {
                    deposit_address: binding.deposit_address,
                    amount: approvable.checked_sub(approved)?,
                });
            }
        }
    }

    if process_withdrawals {
        for withdrawal in db::get_unapproved_withdrawals(&state.pool).await? {
            let burn_address = evm::parse_address(&withdrawal.burn_address)?;
            let burn = state
                .evm
                .burn_record(burn_address, withdrawal.burn_index as u64)
                .await?;
            if !policy.meets_tax(burn.amount) {
                continue;
            }
            pending.withdrawal_payouts.push(WithdrawalPayout {
                burn_address: withdrawal.burn_address.clone(),
                burn_index: withdrawal.burn_index as u64,
                burn_destination: burn.destination.clone(),
                amount: policy.amount_after_tax(burn.amount)?,
            });
            pending.withdrawal_tax_payouts.push(WithdrawalTaxPayout {
                burn_address: withdrawal.burn_address,
                burn_index: withdrawal.burn_index as u64,
                burn_destination: burn.destination,
                amount: policy.tax(burn.amount)?,
            });
        }
    }

    Ok(pending)
}

/// Confirmed UTXOs at the change address and at every non-empty deposit
/// address. Recomputed per payout round, never stored.
pub async fn compute_unspent(state: &AppState) -> Result<Vec<UnspentOutput>> {
    let dingo_settings = &state.settings.dingo_settings;
    let mut unspent = state
        .dingo
        .list_unspent(
            dingo_settings.change_confirmations,
            std::slice::from_ref(&dingo_settings.change_address),
        )
        .await?;

    let received = state
        .dingo
        .list_received_by_address(dingo_settings.deposit_confirmations)
        .await?;
    let deposit_addresses: Vec<String> = db::get_mint_bindings(&state.pool, None)
        .await?
        .into_iter()
        .map(|b| b.deposit_address)
        .filter(|a| received.get(a).is_some_and(|amount| !amount.is_zero()))
        .collect();
    if !deposit_addresses.is_empty() {
        unspent.extend(
            state
                .dingo
                .list_unspent(dingo_settings.deposit_confirmations, &deposit_addresses)
                .await?,
        );
    }
    Ok(unspent)
}

/// Records present in every authority's reply survive. Order follows the
/// first list.
pub fn intersect<T: Eq + Hash + Clone>(lists: &[Vec<T>]) -> Vec<T> {
    let Some((first, rest)) = lists.split_first() else {
        return Vec::new();
    };
    let sets: Vec<HashSet<&T>> = rest.iter().map(|l| l.iter().collect()).collect();
    first
        .iter()
        .filter(|item| sets.iter().all(|set| set.contains(item)))
        .cloned()
        .collect()
}

/// Intersection can strip one half of a withdrawal/tax pair; drop the other
/// half too so the batch stays pairwise complete.
pub fn repair_withdrawal_pairs(pending: &mut PendingPayouts) {
    let payout_keys: HashSet<(String, u64)> = pending
        .withdrawal_payouts
        .iter()
        .map(|p| (p.burn_address.clone(), p.burn_index))
        .collect();
    let tax_keys: HashSet<(String, u64)> = pending
        .withdrawal_tax_payouts
        .iter()
        .map(|p| (p.burn_address.clone(), p.burn_index))
        .collect();
    pending
        .withdrawal_payouts
        .retain(|p| tax_keys.contains(&(p.burn_address.clone(), p.burn_index)));
    pending
        .withdrawal_tax_payouts
        .retain(|p| payout_keys.contains(&(p.burn_address.clone(), p.burn_index)));
}

/// Step C: validate a batch against this node's own view.
///
/// Returns `(totalTax, networkFee)`.
pub fn validate_payouts(
    view: &ChainStateView,
    policy: &TaxPolicy,
    pending: &PendingPayouts,
) -> Result<(Satoshi, Satoshi)> {
    let total_tax = Satoshi::sum(
        pending
            .deposit_tax_payouts
            .iter()
            .map(|p| p.amount)
            .chain(pending.withdrawal_tax_payouts.iter().map(|p| p.amount)),
    )?;
    // Withdrawal tax payouts are deliberately excluded from this count.
    let payout_count = pending.deposit_tax_payouts.len() + pending.withdrawal_payouts.len();
    let network_fee = Satoshi::from_sat(
        policy
            .payout_network_fee_per_tx
            .sat()
            .checked_mul(payout_count as u64)
            .ok_or_else(|| Error::AccountingInvariantViolated("fee overflow".into()))?,
    );
    if total_tax < network_fee {
        return Err(Error::InsufficientTaxForFee {
            total_tax,
            network_fee,
        });
    }

    for payout in &pending.deposit_tax_payouts {
        let binding = view.bindings.get(&payout.deposit_address).ok_or_else(|| {
            Error::Consensus(format!(
                "deposit address {} is not bound here",
                payout.deposit_address
            ))
        })?;
        let balance = view
            .received
            .get(&payout.deposit_address)
            .copied()
            .filter(|b| policy.meets_tax(*b))
            .ok_or_else(|| {
                Error::Consensus(format!(
                    "deposit address {} has no taxable balance here",
                    payout.deposit_address
                ))
            })?;
        let approvable = policy.tax(balance)?;
        if payout.amount.checked_add(binding.approved_tax)? > approvable {
            return Err(Error::Consensus(format!(
                "deposit tax payout for {} exceeds the approvable ceiling",
                payout.deposit_address
            )));
        }
    }

    if pending.withdrawal_payouts.len() != pending.withdrawal_tax_payouts.len() {
        return Err(Error::Consensus(
            "withdrawal payouts and tax payouts are not paired".into(),
        ));
    }
    for (payout, tax_payout) in pending
        .withdrawal_payouts
        .iter()
        .zip(&pending.withdrawal_tax_payouts)
    {
        if payout.burn_address != tax_payout.burn_address
            || payout.burn_index != tax_payout.burn_index
        {
            return Err(Error::Consensus(
                "withdrawal payout pair keys disagree".into(),
            ));
        }
        let key = (payout.burn_address.clone(), payout.burn_index as i64);
        let withdrawal = view.withdrawals.get(&key).ok_or_else(|| {
            Error::Consensus(format!(
                "withdrawal ({}, {}) was never submitted here",
                payout.burn_address, payout.burn_index
            ))
        })?;
        if !withdrawal.is_submitted() {
            return Err(Error::Consensus(format!(
                "withdrawal ({}, {}) is already approved",
                payout.burn_address, payout.burn_index
            )));
        }
        let burn = view
            .burns
            .get(&(payout.burn_address.clone(), payout.burn_index))
            .ok_or_else(|| {
                Error::Consensus(format!(
                    "no burn record for ({}, {})",
                    payout.burn_address, payout.burn_index
                ))
            })?;
        if burn.destination != payout.burn_destination
            || burn.destination != tax_payout.burn_destination
        {
            return Err(Error::Consensus(
                "withdrawal destination does not match the burn record".into(),
            ));
        }
        if payout.amount != policy.amount_after_tax(burn.amount)?
            || tax_payout.amount != policy.tax(burn.amount)?
        {
            return Err(Error::Consensus(
                "withdrawal amounts do not match the burn record".into(),
            ));
        }
    }

    Ok((total_tax, network_fee))
}

/// Step D: deterministic vout construction. A `BTreeMap` keeps the output
/// order identical on every authority.
pub fn build_vouts(
    pending: &PendingPayouts,
    total_tax: Satoshi,
    network_fee: Satoshi,
    total_unspent: Satoshi,
    policy: &TaxPolicy,
    tax_payout_addresses: &[String],
    change_address: &str,
) -> Result<BTreeMap<String, Satoshi>> {
    let mut vouts: BTreeMap<String, Satoshi> = BTreeMap::new();

    for payout in &pending.withdrawal_payouts {
        let entry = vouts
            .entry(payout.burn_destination.clone())
            .or_insert(Satoshi::ZERO);
        *entry = entry.checked_add(payout.amount)?;
    }

    // Integer split of the collected tax; the division dust is absorbed into
    // the change vout.
    let distributable = total_tax.checked_sub(network_fee)?;
    let share = Satoshi::from_sat(distributable.sat() / tax_payout_addresses.len() as u64);
    if !share.is_zero() {
        for address in tax_payout_addresses {
            let entry = vouts.entry(address.clone()).or_insert(Satoshi::ZERO);
            *entry = entry.checked_add(share)?;
        }
    }

    let paid = Satoshi::sum(vouts.values().copied())?;
    let change = total_unspent
        .checked_sub(paid)
        .and_then(|rest| rest.checked_sub(network_fee))
        .map_err(|_| {
            Error::InsufficientFunds(format!(
                "unspent {total_unspent} cannot cover payouts {paid} plus fee {network_fee}"
            ))
        })?;
    let entry = vouts.entry(change_address.to_string()).or_insert(Satoshi::ZERO);
    *entry = entry.checked_add(change)?;

    vouts.retain(|_, amount| *amount >= policy.dust_threshold);
    Ok(vouts)
}

/// Prefetch everything [`validate_payouts`] needs for a given batch.
pub async fn load_chain_state_view(
    state: &AppState,
    pending: &PendingPayouts,
) -> Result<ChainStateView> {
    let received = state
        .dingo
        .list_received_by_address(state.settings.dingo_settings.deposit_confirmations)
        .await?;
    let bindings = db::get_mint_bindings(&state.pool, None)
        .await?
        .into_iter()
        .map(|b| (b.deposit_address.clone(), b))
        .collect();
    let withdrawals = db::get_withdrawals(&state.pool)
        .await?
        .into_iter()
        .map(|w| ((w.burn_address.clone(), w.burn_index), w))
        .collect();

    let mut burns = HashMap::new();
    for payout in &pending.withdrawal_payouts {
        let address = evm::parse_address(&payout.burn_address)?;
        let burn = state.evm.burn_record(address, payout.burn_index).await?;
        burns.insert((payout.burn_address.clone(), payout.burn_index), burn);
    }

    Ok(ChainStateView {
        received,
        bindings,
        withdrawals,
        burns,
    })
}

fn pending_from_request(request: &ApprovePayoutsRequest) -> PendingPayouts {
    PendingPayouts {
        deposit_tax_payouts: request.deposit_tax_payouts.clone(),
        withdrawal_payouts: request.withdrawal_payouts.clone(),
        withdrawal_tax_payouts: request.withdrawal_tax_payouts.clone(),
    }
}

/// Step E, one authority's turn: validate the batch against local state,
/// verify the raw transaction shape, sign, and (outside test mode) apply the
/// SUBMITTED→APPROVED transitions and the monotone `approved_tax` increases.
///
/// The whole critical section runs under the write lock so no other writer
/// can move state between validation and the local apply.
pub async fn approve_payouts(
    state: &AppState,
    request: ApprovePayoutsRequest,
    test_mode: bool,
) -> Result<ApprovePayoutsResponse> {
    let _write = state.write_lock.lock().await;

    let own_unspent: HashSet<UnspentOutput> =
        compute_unspent(state).await?.into_iter().collect();
    for utxo in &request.unspent {
        if !own_unspent.contains(utxo) {
            return Err(Error::Consensus(format!(
                "unspent {}:{} is not in this node's view",
                utxo.txid, utxo.vout
            )));
        }
    }

    let pending = pending_from_request(&request);
    let view = load_chain_state_view(state, &pending).await?;
    let policy = &state.settings.dingo_settings.tax;
    let (total_tax, network_fee) = validate_payouts(&view, policy, &pending)?;

    let total_unspent = Satoshi::sum(request.unspent.iter().map(|u| u.amount))?;
    let vouts = build_vouts(
        &pending,
        total_tax,
        network_fee,
        total_unspent,
        policy,
        &state.settings.dingo_settings.tax_payout_addresses,
        &state.settings.dingo_settings.change_address,
    )?;

    state
        .dingo
        .verify_raw_transaction(&request.unspent, &vouts, &request.approval_chain)
        .await?;
    let signed = state
        .dingo
        .sign_raw_transaction(&request.approval_chain)
        .await?;

    if !test_mode {
        let mut bindings = Vec::with_capacity(pending.deposit_tax_payouts.len());
        for payout in &pending.deposit_tax_payouts {
            // Validated above, so the binding exists.
            let mut binding = view.bindings[&payout.deposit_address].clone();
            binding.approved_tax = binding.approved_tax.checked_add(payout.amount)?;
            bindings.push(binding);
        }
        let mut withdrawals = Vec::with_capacity(pending.withdrawal_payouts.len());
        for (payout, tax_payout) in pending
            .withdrawal_payouts
            .iter()
            .zip(&pending.withdrawal_tax_payouts)
        {
            withdrawals.push(Withdrawal {
                burn_address: payout.burn_address.clone(),
                burn_index: payout.burn_index as i64,
                approved_amount: payout.amount,
                approved_tax: tax_payout.amount,
            });
        }
        db::apply_payout_mutations(&state.pool, &bindings, &withdrawals).await?;
        metrics::PAYOUTS_COSIGNED.inc();
        tracing::info!(
            deposit_taxes = pending.deposit_tax_payouts.len(),
            withdrawals = pending.withdrawal_payouts.len(),
            total_tax = %total_tax,
            "co-signed payout batch"
        );
    }

    Ok(ApprovePayoutsResponse {
        approval_chain: signed.hex,
    })
}

/// Coordinator entry point: gather consensus, build the settlement
/// transaction, walk the committee for signatures, broadcast.
pub async fn execute_payouts(
    state: &AppState,
    request: ExecutePayoutsRequest,
) -> Result<ExecutePayoutsResponse> {
    if !state.is_coordinator() {
        return Err(Error::Unauthorized(
            "this node is not the payout coordinator".into(),
        ));
    }
    let (process_deposits, process_withdrawals) =
        (request.process_deposits, request.process_withdrawals);
    if !process_deposits && !process_withdrawals {
        return Err(Error::MalformedRequest(
            "at least one of processDeposits/processWithdrawals must be set".into(),
        ));
    }

    // Step B: intersect every authority's view; records present everywhere
    // survive, electing the largest batch all nodes can sign.
    let mut payout_lists =
        vec![compute_pending_payouts(state, process_deposits, process_withdrawals).await?];
    let mut unspent_lists = vec![compute_unspent(state).await?];

    let nodes = &state.settings.public_settings.authority_nodes;
    let peer_views = futures::future::try_join_all(
        nodes
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != state.self_index)
            .map(|(_, node)| async move {
                let compute_request = state
                    .seal(&ComputePendingPayoutsRequest {
                        process_deposits,
                        process_withdrawals,
                    })
                    .await?;
                let reply = state
                    .peers
                    .post(node, "/computePendingPayouts", &compute_request)
                    .await?;
                let pending = reply.open::<PendingPayouts>()?;

                let unspent_request = state.seal(&ComputeUnspentRequest {}).await?;
                let reply = state
                    .peers
                    .post(node, "/computeUnspent", &unspent_request)
                    .await?;
                let unspent = reply.open::<ComputeUnspentResponse>()?.unspent;
                Ok::<_, Error>((pending, unspent))
            }),
    )
    .await?;
    for (pending, unspent) in peer_views {
        payout_lists.push(pending);
        unspent_lists.push(unspent);
    }

    let mut pending = PendingPayouts {
        deposit_tax_payouts: intersect(
            &payout_lists
                .iter()
                .map(|p| p.deposit_tax_payouts.clone())
                .collect::<Vec<_>>(),
        ),
        withdrawal_payouts: intersect(
            &payout_lists
                .iter()
                .map(|p| p.withdrawal_payouts.clone())
                .collect::<Vec<_>>(),
        ),
        withdrawal_tax_payouts: intersect(
            &payout_lists
                .iter()
                .map(|p| p.withdrawal_tax_payouts.clone())
                .collect::<Vec<_>>(),
        ),
    };
    repair_withdrawal_pairs(&mut pending);
    let unspent = intersect(&unspent_lists);

    if pending.is_empty() {
        return Err(Error::NothingToPayOut);
    }

    // Steps C and D, locally first, so an unbuildable batch never reaches
    // the committee.
    let view = load_chain_state_view(state, &pending).await?;
    let policy = &state.settings.dingo_settings.tax;
    let (total_tax, network_fee) = validate_payouts(&view, policy, &pending)?;
    let total_unspent = Satoshi::sum(unspent.iter().map(|u| u.amount))?;
    let vouts = build_vouts(
        &pending,
        total_tax,
        network_fee,
        total_unspent,
        policy,
        &state.settings.dingo_settings.tax_payout_addresses,
        &state.settings.dingo_settings.change_address,
    )?;

    // Step E: C_0, then one signature per authority in configured order.
    let mut approval_chain = state.dingo.create_raw_transaction(&unspent, &vouts).await?;
    for (index, node) in nodes.iter().enumerate() {
        let approve_request = ApprovePayoutsRequest {
            deposit_tax_payouts: pending.deposit_tax_payouts.clone(),
            withdrawal_payouts: pending.withdrawal_payouts.clone(),
            withdrawal_tax_payouts: pending.withdrawal_tax_payouts.clone(),
            unspent: unspent.clone(),
            approval_chain: approval_chain.clone(),
        };
        let response = if index == state.self_index {
            approve_payouts(state, approve_request, false).await?
        } else {
            let sealed = state.seal(&approve_request).await?;
            let reply = state.peers.post(node, "/approvePayouts", &sealed).await?;
            reply.open::<ApprovePayoutsResponse>()?
        };
        approval_chain = response.approval_chain;
    }

    let txid = state.dingo.send_raw_transaction(&approval_chain).await?;
    metrics::PAYOUTS_BROADCAST.inc();
    tracing::info!(
        txid = %txid,
        deposit_taxes = pending.deposit_tax_payouts.len(),
        withdrawals = pending.withdrawal_payouts.len(),
        "settlement transaction broadcast"
    );

    Ok(ExecutePayoutsResponse {
        approval_chain,
        txid,
    })
}
