// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server callback functions.
//!
//! Functions in this module verify parameters and convert between types (API
//! request types to lifecycle operations, lifecycle errors to HTTP errors).
//! The state machine itself lives in the `lifecycle` module.

use std::sync::Arc;

use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseAccepted,
    HttpResponseDeleted, HttpResponseOk, Path, RequestContext, TypedBody,
};
use lightsnap_api_types as api;
use slog::{info, Logger};

use crate::fleet::FleetScheduler;
use crate::lifecycle::{InstanceLifecycle, OpContext};

/// Context accessible from HTTP callbacks.
pub struct DropshotEndpointContext {
    pub lifecycle: Arc<InstanceLifecycle>,
    pub fleet: Arc<FleetScheduler>,
    pub log: Logger,
}

impl DropshotEndpointContext {
    pub fn new(
        lifecycle: Arc<InstanceLifecycle>,
        fleet: Arc<FleetScheduler>,
        log: Logger,
    ) -> Self {
        Self { lifecycle, fleet, log }
    }

    /// Requests run under the server's configured hypervisor deadline.
    fn op_context(&self) -> OpContext {
        OpContext::new()
    }
}

#[endpoint {
    method = GET,
    path = "/instances/{instance_id}/snapshot",
}]
async fn instance_snapshot_get(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
) -> Result<HttpResponseOk<api::InstanceSnapshotStatus>, HttpError> {
    let id = path_params.into_inner().instance_id;
    let status = rqctx.context().lifecycle.describe(id).await?;
    Ok(HttpResponseOk(status))
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/snapshot/enable",
}]
async fn instance_snapshot_enable(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
) -> Result<HttpResponseOk<api::FeatureToggleResponse>, HttpError> {
    let ctx = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let (outcome, status) =
        ctx.lifecycle.enable(&ctx.op_context(), id).await?;
    Ok(HttpResponseOk(api::FeatureToggleResponse { outcome, status }))
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/snapshot/disable",
}]
async fn instance_snapshot_disable(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
) -> Result<HttpResponseOk<api::FeatureToggleResponse>, HttpError> {
    let ctx = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let (outcome, status) =
        ctx.lifecycle.disable(&ctx.op_context(), id).await?;
    Ok(HttpResponseOk(api::FeatureToggleResponse { outcome, status }))
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/snapshot/daily",
}]
async fn instance_snapshot_daily(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
    request: TypedBody<api::DailySnapshotRequest>,
) -> Result<HttpResponseOk<api::InstanceSnapshotStatus>, HttpError> {
    let id = path_params.into_inner().instance_id;
    let enable = request.into_inner().enable;
    let status = rqctx.context().lifecycle.set_daily(id, enable).await?;
    Ok(HttpResponseOk(status))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/snapshot",
}]
async fn instance_snapshot_take(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
) -> Result<HttpResponseOk<api::TakeSnapshotResponse>, HttpError> {
    let ctx = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let (snapshot_id, status) =
        ctx.lifecycle.take_snapshot(&ctx.op_context(), id).await?;
    Ok(HttpResponseOk(api::TakeSnapshotResponse { snapshot_id, status }))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/snapshot/commit",
}]
async fn instance_snapshot_commit(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
) -> Result<HttpResponseOk<api::InstanceSnapshotStatus>, HttpError> {
    let ctx = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let status = ctx.lifecycle.commit(&ctx.op_context(), id).await?;
    Ok(HttpResponseOk(status))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/snapshot/recover",
}]
async fn instance_snapshot_recover(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
    request: TypedBody<api::RecoverRequest>,
) -> Result<HttpResponseOk<api::InstanceSnapshotStatus>, HttpError> {
    let ctx = rqctx.context();
    let id = path_params.into_inner().instance_id;
    let api::RecoverRequest { snap_index, use_root } = request.into_inner();
    let status = ctx
        .lifecycle
        .recover(&ctx.op_context(), id, snap_index, use_root)
        .await?;
    Ok(HttpResponseOk(status))
}

/// Cleanup hook for instance deletion: drops the instance's snapshot record.
#[endpoint {
    method = DELETE,
    path = "/instances/{instance_id}/snapshot",
}]
async fn instance_snapshot_forget(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::InstancePathParams>,
) -> Result<HttpResponseDeleted, HttpError> {
    let id = path_params.into_inner().instance_id;
    rqctx.context().lifecycle.forget(id).await?;
    Ok(HttpResponseDeleted())
}

#[endpoint {
    method = POST,
    path = "/snapshot-all",
}]
async fn snapshot_all(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    request: TypedBody<api::SnapshotAllRequest>,
) -> Result<HttpResponseAccepted<api::SnapshotAllResponse>, HttpError> {
    let ctx = rqctx.context();
    let daily = request.into_inner().daily;
    let batch_id = ctx.fleet.snapshot_all_hosts(daily).await?;
    info!(ctx.log, "snapshot batch accepted";
          "batch" => %batch_id,
          "daily" => daily);
    Ok(HttpResponseAccepted(api::SnapshotAllResponse { batch_id }))
}

#[endpoint {
    method = GET,
    path = "/snapshot-all",
}]
async fn snapshot_all_list(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
) -> Result<HttpResponseOk<api::BatchListResponse>, HttpError> {
    let batches = rqctx.context().fleet.list_batches();
    Ok(HttpResponseOk(api::BatchListResponse { batches }))
}

#[endpoint {
    method = GET,
    path = "/snapshot-all/{batch_id}",
}]
async fn snapshot_all_get(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::BatchPathParams>,
) -> Result<HttpResponseOk<api::BatchReport>, HttpError> {
    let batch_id = path_params.into_inner().batch_id;
    let report = rqctx.context().fleet.batch_report(batch_id);
    report.map(HttpResponseOk).ok_or_else(|| {
        HttpError::for_not_found(
            None,
            format!("No snapshot batch with ID {batch_id}"),
        )
    })
}

#[endpoint {
    method = GET,
    path = "/snapshot-enabled",
}]
async fn snapshot_enabled_list(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
) -> Result<HttpResponseOk<api::EnabledInstancesResponse>, HttpError> {
    let instances = rqctx.context().fleet.enabled_instances_all().await?;
    Ok(HttpResponseOk(api::EnabledInstancesResponse { instances }))
}

#[endpoint {
    method = GET,
    path = "/hosts/{host}/snapshot-enabled",
}]
async fn host_snapshot_enabled_list(
    rqctx: RequestContext<Arc<DropshotEndpointContext>>,
    path_params: Path<api::HostPathParams>,
) -> Result<HttpResponseOk<api::EnabledInstancesResponse>, HttpError> {
    let host = path_params.into_inner().host;
    let instances = rqctx.context().fleet.enabled_instances(&host).await?;
    Ok(HttpResponseOk(api::EnabledInstancesResponse { instances }))
}

/// Returns a Dropshot [`ApiDescription`] object to launch a server.
pub fn api() -> ApiDescription<Arc<DropshotEndpointContext>> {
    let mut api = ApiDescription::new();
    api.register(instance_snapshot_get).unwrap();
    api.register(instance_snapshot_enable).unwrap();
    api.register(instance_snapshot_disable).unwrap();
    api.register(instance_snapshot_daily).unwrap();
    api.register(instance_snapshot_take).unwrap();
    api.register(instance_snapshot_commit).unwrap();
    api.register(instance_snapshot_recover).unwrap();
    api.register(instance_snapshot_forget).unwrap();
    api.register(snapshot_all).unwrap();
    api.register(snapshot_all_list).unwrap();
    api.register(snapshot_all_get).unwrap();
    api.register(snapshot_enabled_list).unwrap();
    api.register(host_snapshot_enabled_list).unwrap();

    api
}
