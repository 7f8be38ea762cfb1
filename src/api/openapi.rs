//! OpenAPI document assembled from the handlers' `utoipa::path` annotations.

use utoipa::OpenApi;

use super::handlers::{admin, disputes, marketplace, system, wallet};
use crate::error::{ErrorBody, ErrorResponse};

/// OpenAPI document for the HTTP surface.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "escrow-gateway",
        description = "Idempotent purchases, escrow, disputes and background job administration."
    ),
    paths(
        marketplace::purchase_material,
        marketplace::donate,
        marketplace::buy_ticket,
        disputes::create_dispute,
        disputes::my_disputes,
        wallet::deposit,
        wallet::get_wallet,
        admin::resolve_dispute,
        admin::open_disputes,
        admin::investigate_dispute,
        admin::upsert_listing,
        admin::submit_job,
        admin::list_dead_letters,
        admin::retry_dead_letter,
        admin::discard_dead_letter,
        system::health_handler,
    ),
    components(schemas(ErrorResponse, ErrorBody)),
    tags(
        (name = "Marketplace", description = "Guarded money-moving purchases"),
        (name = "Disputes", description = "Buyer claims against escrowed transactions"),
        (name = "Wallet", description = "Balances and deposits"),
        (name = "Admin", description = "Dispute resolution and job administration"),
        (name = "System", description = "Health"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_guarded_endpoints() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/marketplace/purchase"));
        assert!(doc.paths.paths.contains_key("/admin/resolve-dispute/{id}"));
        assert!(doc.paths.paths.contains_key("/health"));
    }
}
