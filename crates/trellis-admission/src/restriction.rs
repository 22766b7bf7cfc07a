//! Workload-restriction stage: certificate requests must describe a live
//! pod and be owned by the node that pod runs on.

use std::sync::Arc;

use tracing::debug;
use trellis_api::{CertRequest, Pod};
use trellis_store::{
    is_authorized_for_signer_name, AdmissionError, AdmissionPlugin, AdmissionRequest, Authorizer,
    Operation, PodLookup, Subresource,
};

/// Verb required to write the status subresource of a request addressed to
/// a signer.
pub const SIGN_VERB: &str = "sign";

/// Prefix of node identities.
const NODE_PRINCIPAL_PREFIX: &str = "system:node:";

/// Mutating + validating stage for [`CertRequest`] writes.
///
/// On create, the mutator binds the request to the live pod: it overwrites
/// `serviceAccount` and `node` from the pod and `requester` from the
/// authenticated principal. The validator then enforces, in order:
/// requester lockdown on the main resource, sign authority on the status
/// subresource, pod liveness/consistency, and the requester-to-node
/// binding.
pub struct WorkloadRestriction {
    authz: Arc<dyn Authorizer>,
    pods: Arc<dyn PodLookup>,
}

impl WorkloadRestriction {
    /// A stage backed by the given authorizer and pod view.
    pub fn new(authz: Arc<dyn Authorizer>, pods: Arc<dyn PodLookup>) -> Self {
        Self { authz, pods }
    }

    /// Fetch the pod the request refers to and check its UID, denying with
    /// a targeted message otherwise.
    fn live_pod(&self, request: &CertRequest) -> Result<Pod, AdmissionError> {
        let pod = self
            .pods
            .pod(&request.metadata.namespace, &request.spec.pod)
            .ok_or_else(|| {
                AdmissionError::forbidden(format!(
                    "the named pod {}/{} does not exist in the cluster",
                    request.metadata.namespace, request.spec.pod
                ))
            })?;

        if pod.uid != request.spec.pod_uid {
            return Err(AdmissionError::forbidden(format!(
                "pod UID mismatch (pod has {}, certificate request has {})",
                pod.uid, request.spec.pod_uid
            )));
        }

        Ok(pod)
    }
}

impl AdmissionPlugin<CertRequest> for WorkloadRestriction {
    fn mutate(
        &self,
        req: &AdmissionRequest,
        new: &mut CertRequest,
        _old: Option<&CertRequest>,
    ) -> Result<(), AdmissionError> {
        if req.operation != Operation::Create {
            return Ok(());
        }

        let pod = self.live_pod(new)?;
        new.spec.service_account = pod.service_account;
        new.spec.node = pod.node;
        new.spec.requester = req.principal.name.clone();
        Ok(())
    }

    fn validate(
        &self,
        req: &AdmissionRequest,
        new: &CertRequest,
        _old: Option<&CertRequest>,
    ) -> Result<(), AdmissionError> {
        // Requester lockdown: after creation, no one but the named
        // requester may touch the main resource. (On create the mutator
        // just set requester to the principal, so this also holds there.)
        if req.subresource == Subresource::Main && req.principal.name != new.spec.requester {
            return Err(AdmissionError::forbidden(format!(
                "only the original requester {:?} may modify this certificate request",
                new.spec.requester
            )));
        }

        // Status writes require sign authority on the signer.
        if req.subresource == Subresource::Status
            && !is_authorized_for_signer_name(
                self.authz.as_ref(),
                &req.principal,
                SIGN_VERB,
                &new.spec.signer_name,
            )
        {
            debug!(
                request = %new.metadata.key(),
                signer = %new.spec.signer_name,
                principal = %req.principal.name,
                "denying status write: principal may not sign for this signer"
            );
            return Err(AdmissionError::forbidden(format!(
                "user not permitted to sign requests with signerName {:?}",
                new.spec.signer_name
            )));
        }

        // The request must refer to a pod currently running in the cluster
        // and be consistent with it.
        let pod = self.live_pod(new)?;
        if pod.service_account != new.spec.service_account {
            return Err(AdmissionError::forbidden(format!(
                "pod service account mismatch (pod has {}, certificate request has {})",
                pod.service_account, new.spec.service_account
            )));
        }
        if pod.node != new.spec.node {
            return Err(AdmissionError::forbidden(format!(
                "pod node mismatch (pod has {}, certificate request has {})",
                pod.node, new.spec.node
            )));
        }

        // The requester must be the identity of the named node.
        if new.spec.requester.strip_prefix(NODE_PRINCIPAL_PREFIX) != Some(new.spec.node.as_str()) {
            return Err(AdmissionError::forbidden(format!(
                "the requester {} is not related to node {}",
                new.spec.requester, new.spec.node
            )));
        }

        Ok(())
    }
}
