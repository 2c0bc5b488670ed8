use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backoff::{Backoff, retry};
use crate::{CloudError, CloudProvider};

/// One name/values filter on an instance query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub name: String,
    pub values: Vec<String>,
}

impl InstanceFilter {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            values: vec![value.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
}

/// One page of an instance query; `next_token` continues the listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancePage {
    pub instances: Vec<InstanceRecord>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingInstanceRecord {
    pub instance_id: String,
    pub group_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingInstancePage {
    pub instances: Vec<ScalingInstanceRecord>,
    pub next_token: Option<String>,
}

/// Paginated instance-description endpoint of the elastic compute API.
/// The concrete HTTP transport is an external collaborator; the resolver
/// owns filtering, pagination, retry and ambiguity policy.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_instances(
        &self,
        filters: &[InstanceFilter],
        next_token: Option<&str>,
    ) -> Result<InstancePage, CloudError>;
}

/// Paginated group-membership endpoint of the auto-scaling API.
#[async_trait]
pub trait AutoScalingApi: Send + Sync {
    async fn describe_scaling_instances(
        &self,
        instance_ids: &[String],
        next_token: Option<&str>,
    ) -> Result<ScalingInstancePage, CloudError>;
}

/// Resolver backed by elastic-scaling-group style APIs: a node is located by
/// its private DNS name among running instances, and its group by a second
/// query keyed on the resolved instance id.
pub struct AwsCloud {
    ec2: Arc<dyn Ec2Api>,
    asg: Arc<dyn AutoScalingApi>,
    backoff: Backoff,
}

impl AwsCloud {
    pub fn new(ec2: Arc<dyn Ec2Api>, asg: Arc<dyn AutoScalingApi>, backoff: Backoff) -> Self {
        Self { ec2, asg, backoff }
    }

    /// Drain every page of the instance query.
    async fn describe_all_instances(
        &self,
        filters: &[InstanceFilter],
    ) -> Result<Vec<InstanceRecord>, CloudError> {
        let mut results = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = retry(&self.backoff, || {
                let token = token.clone();
                async move {
                    self.ec2
                        .describe_instances(filters, token.as_deref())
                        .await
                }
            })
            .await?;
            results.extend(page.instances);
            match page.next_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(results)
    }

    async fn describe_all_scaling_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<ScalingInstanceRecord>, CloudError> {
        let mut results = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = retry(&self.backoff, || {
                let token = token.clone();
                async move {
                    self.asg
                        .describe_scaling_instances(instance_ids, token.as_deref())
                        .await
                }
            })
            .await?;
            results.extend(page.instances);
            match page.next_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    async fn instance_id(&self, node_name: &str) -> Result<String, CloudError> {
        let filters = [
            InstanceFilter::new("private-dns-name", node_name),
            InstanceFilter::new("instance-state-name", "running"),
        ];
        let instances = self.describe_all_instances(&filters).await?;
        debug!(
            "instance query for {} returned {} records",
            node_name,
            instances.len()
        );

        match instances.len() {
            0 => Err(CloudError::InstanceNotFound(node_name.to_string())),
            1 => {
                let id = &instances[0].instance_id;
                if id.is_empty() {
                    return Err(CloudError::Transient(format!(
                        "empty instance id returned for {}",
                        node_name
                    )));
                }
                Ok(id.clone())
            }
            // more than one match must fail, never pick arbitrarily
            _ => Err(CloudError::Ambiguous(node_name.to_string())),
        }
    }

    async fn instance_group(&self, node_name: &str) -> Result<String, CloudError> {
        let instance_id = self.instance_id(node_name).await?;

        let instances = self
            .describe_all_scaling_instances(&[instance_id])
            .await?;
        match instances.len() {
            0 => Err(CloudError::GroupNotFound(node_name.to_string())),
            1 => Ok(instances[0].group_name.clone()),
            _ => Err(CloudError::Ambiguous(node_name.to_string())),
        }
    }
}

/// Derives the region from an availability zone name by dropping the zone
/// letter. Fails on empty input.
pub fn region_from_zone(zone: &str) -> anyhow::Result<String> {
    if zone.is_empty() {
        anyhow::bail!("invalid (empty) availability zone");
    }
    Ok(zone[..zone.len() - 1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves instance records one per page to exercise pagination.
    struct PagedEc2 {
        records: Vec<InstanceRecord>,
        calls: AtomicUsize,
        seen_tokens: Mutex<Vec<Option<String>>>,
        fail_first: bool,
    }

    #[async_trait]
    impl Ec2Api for PagedEc2 {
        async fn describe_instances(
            &self,
            _filters: &[InstanceFilter],
            next_token: Option<&str>,
        ) -> Result<InstancePage, CloudError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_tokens
                .lock()
                .unwrap()
                .push(next_token.map(str::to_string));
            if self.fail_first && call == 0 {
                return Err(CloudError::Transient("throttled".into()));
            }
            let idx = next_token.map(|t| t.parse::<usize>().unwrap()).unwrap_or(0);
            let mut page = InstancePage::default();
            if let Some(record) = self.records.get(idx) {
                page.instances.push(record.clone());
            }
            if idx + 1 < self.records.len() {
                page.next_token = Some((idx + 1).to_string());
            }
            Ok(page)
        }
    }

    struct StaticAsg {
        records: Vec<ScalingInstanceRecord>,
    }

    #[async_trait]
    impl AutoScalingApi for StaticAsg {
        async fn describe_scaling_instances(
            &self,
            instance_ids: &[String],
            _next_token: Option<&str>,
        ) -> Result<ScalingInstancePage, CloudError> {
            Ok(ScalingInstancePage {
                instances: self
                    .records
                    .iter()
                    .filter(|r| instance_ids.contains(&r.instance_id))
                    .cloned()
                    .collect(),
                next_token: None,
            })
        }
    }

    fn record(id: &str) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
        }
    }

    fn cloud(ec2: PagedEc2, asg: StaticAsg) -> (AwsCloud, Arc<PagedEc2>) {
        let ec2 = Arc::new(ec2);
        let backoff = Backoff {
            steps: 3,
            base: std::time::Duration::from_millis(1),
            factor: 2.0,
            jitter: 0.0,
        };
        (
            AwsCloud::new(ec2.clone(), Arc::new(asg), backoff),
            ec2,
        )
    }

    fn paged(records: Vec<InstanceRecord>) -> PagedEc2 {
        PagedEc2 {
            records,
            calls: AtomicUsize::new(0),
            seen_tokens: Mutex::new(Vec::new()),
            fail_first: false,
        }
    }

    #[tokio::test]
    async fn single_instance_resolves() {
        let (cloud, _) = cloud(paged(vec![record("i-1")]), StaticAsg { records: vec![] });
        assert_eq!(cloud.instance_id("worker-1").await.unwrap(), "i-1");
    }

    #[tokio::test]
    async fn zero_matches_is_not_found() {
        let (cloud, _) = cloud(paged(vec![]), StaticAsg { records: vec![] });
        assert_eq!(
            cloud.instance_id("worker-1").await.unwrap_err(),
            CloudError::InstanceNotFound("worker-1".into())
        );
    }

    #[tokio::test]
    async fn multiple_matches_is_ambiguous() {
        let (cloud, ec2) = cloud(
            paged(vec![record("i-1"), record("i-2")]),
            StaticAsg { records: vec![] },
        );
        assert_eq!(
            cloud.instance_id("worker-1").await.unwrap_err(),
            CloudError::Ambiguous("worker-1".into())
        );
        // both pages were drained before deciding
        assert_eq!(ec2.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *ec2.seen_tokens.lock().unwrap(),
            vec![None, Some("1".to_string())]
        );
    }

    #[tokio::test]
    async fn transient_page_failure_is_retried() {
        let mut ec2 = paged(vec![record("i-1")]);
        ec2.fail_first = true;
        let (cloud, ec2) = cloud(ec2, StaticAsg { records: vec![] });
        assert_eq!(cloud.instance_id("worker-1").await.unwrap(), "i-1");
        assert_eq!(ec2.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn group_lookup_keyed_by_instance_id() {
        let (cloud, _) = cloud(
            paged(vec![record("i-1")]),
            StaticAsg {
                records: vec![ScalingInstanceRecord {
                    instance_id: "i-1".into(),
                    group_name: "workers-asg".into(),
                }],
            },
        );
        assert_eq!(
            cloud.instance_group("worker-1").await.unwrap(),
            "workers-asg"
        );
    }

    #[tokio::test]
    async fn instance_without_group_is_group_not_found() {
        let (cloud, _) = cloud(paged(vec![record("i-1")]), StaticAsg { records: vec![] });
        assert_eq!(
            cloud.instance_group("worker-1").await.unwrap_err(),
            CloudError::GroupNotFound("worker-1".into())
        );
    }

    #[test]
    fn region_derivation() {
        assert_eq!(region_from_zone("us-west-1a").unwrap(), "us-west-1");
        assert!(region_from_zone("").is_err());
    }
}
