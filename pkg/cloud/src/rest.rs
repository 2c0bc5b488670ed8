use async_trait::async_trait;
use reqwest::StatusCode;

use crate::CloudError;
use crate::aws::{AutoScalingApi, Ec2Api, InstanceFilter, InstancePage, ScalingInstancePage};
use crate::scaleset::{MemberPage, ScaleSetApi, ScaleSetPage};
use crate::standalone::{VirtualMachine, VirtualMachineApi};

/// Thin reqwest transport for a cloud API gateway exposing the paginated
/// listing endpoints as JSON resources. All resolver logic (pagination,
/// backoff, caching, ambiguity) stays in the resolvers; this type only moves
/// bytes.
pub struct RestCloudApi {
    base_url: String,
    http: reqwest::Client,
}

impl RestCloudApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Transport failures and server-side errors are all transient from the
/// resolver's point of view; NotFound/Ambiguous classification happens on
/// the resolver side from the returned pages.
fn transient(err: impl std::fmt::Display) -> CloudError {
    CloudError::Transient(err.to_string())
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<T, CloudError> {
    http.get(url)
        .query(query)
        .send()
        .await
        .map_err(transient)?
        .error_for_status()
        .map_err(transient)?
        .json::<T>()
        .await
        .map_err(transient)
}

#[async_trait]
impl Ec2Api for RestCloudApi {
    async fn describe_instances(
        &self,
        filters: &[InstanceFilter],
        next_token: Option<&str>,
    ) -> Result<InstancePage, CloudError> {
        let mut query: Vec<(&str, String)> = filters
            .iter()
            .map(|f| ("filter", format!("{}={}", f.name, f.values.join(","))))
            .collect();
        if let Some(token) = next_token {
            query.push(("nextToken", token.to_string()));
        }
        get_json(&self.http, &self.url("/instances"), &query).await
    }
}

#[async_trait]
impl AutoScalingApi for RestCloudApi {
    async fn describe_scaling_instances(
        &self,
        instance_ids: &[String],
        next_token: Option<&str>,
    ) -> Result<ScalingInstancePage, CloudError> {
        let mut query: Vec<(&str, String)> = instance_ids
            .iter()
            .map(|id| ("instanceId", id.clone()))
            .collect();
        if let Some(token) = next_token {
            query.push(("nextToken", token.to_string()));
        }
        get_json(&self.http, &self.url("/scaling-instances"), &query).await
    }
}

#[async_trait]
impl ScaleSetApi for RestCloudApi {
    async fn list_scale_sets(
        &self,
        next_token: Option<&str>,
    ) -> Result<ScaleSetPage, CloudError> {
        let mut query = Vec::new();
        if let Some(token) = next_token {
            query.push(("nextToken", token.to_string()));
        }
        get_json(&self.http, &self.url("/scalesets"), &query).await
    }

    async fn list_members(
        &self,
        scale_set: &str,
        next_token: Option<&str>,
    ) -> Result<MemberPage, CloudError> {
        let mut query = Vec::new();
        if let Some(token) = next_token {
            query.push(("nextToken", token.to_string()));
        }
        get_json(
            &self.http,
            &self.url(&format!("/scalesets/{}/members", scale_set)),
            &query,
        )
        .await
    }
}

#[async_trait]
impl VirtualMachineApi for RestCloudApi {
    async fn get_virtual_machine(
        &self,
        name: &str,
    ) -> Result<Option<VirtualMachine>, CloudError> {
        let response = self
            .http
            .get(self.url(&format!("/virtualmachines/{}", name)))
            .send()
            .await
            .map_err(transient)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let vm = response
            .error_for_status()
            .map_err(transient)?
            .json::<VirtualMachine>()
            .await
            .map_err(transient)?;
        Ok(Some(vm))
    }
}
